//! Custom functions — extension points invoked from condition trees
//!
//! A custom function participates in three moments of a campaign's life:
//! `invoke` during expression evaluation, `condition_end` once per
//! evaluation pass after the tree has run (contributing extra signals to
//! the next outgoing bundle), and `cleanup` when the campaign leaves the
//! active set.

mod multi_rising_edge;

pub use multi_rising_edge::MultiRisingEdgeTrigger;

use crate::expression::{CustomFnDispatch, InspectionValue};
use crate::types::{RawDataHandle, SignalId};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors local to one invocation; they never propagate past the
/// expression — the evaluator folds them to `Undefined`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FunctionError {
    #[error("argument arity or type mismatch")]
    TypeMismatch,
}

/// A complex-data signal contributed by a function at trigger time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContributedSignal {
    pub signal_id: SignalId,
    pub handle: RawDataHandle,
}

/// Per-campaign extension point called from condition trees.
pub trait CustomFunction: Send {
    /// Called during expression evaluation with the already-evaluated
    /// arguments. A `TypeMismatch` leaves internal state unchanged.
    fn invoke(
        &mut self,
        campaign_sync_id: &str,
        args: &[InspectionValue],
    ) -> Result<InspectionValue, FunctionError>;

    /// Called once per evaluation pass after the tree has run, with the
    /// set of signals a fire would collect into the bundle. May
    /// contribute one complex-data signal; the engine carries it into
    /// the next bundle the campaign assembles.
    fn condition_end(
        &mut self,
        campaign_sync_id: &str,
        collected_signals: &HashSet<SignalId>,
        timestamp_ms: u64,
    ) -> Option<ContributedSignal>;

    /// Called when the campaign is removed; drop any per-campaign state.
    fn cleanup(&mut self, campaign_sync_id: &str);
}

/// Name → function table owned by the inspection engine.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Box<dyn CustomFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, function: Box<dyn CustomFunction>) {
        if self.functions.insert(name.to_string(), function).is_some() {
            warn!(name, "Custom function replaced an existing registration");
        }
    }

    /// Fan the end-of-pass moment out to every registered function.
    pub fn condition_end(
        &mut self,
        campaign_sync_id: &str,
        collected_signals: &HashSet<SignalId>,
        timestamp_ms: u64,
    ) -> Vec<ContributedSignal> {
        self.functions
            .values_mut()
            .filter_map(|f| f.condition_end(campaign_sync_id, collected_signals, timestamp_ms))
            .collect()
    }

    /// Fan campaign removal out to every registered function.
    pub fn cleanup(&mut self, campaign_sync_id: &str) {
        for function in self.functions.values_mut() {
            function.cleanup(campaign_sync_id);
        }
    }
}

impl CustomFnDispatch for FunctionRegistry {
    fn invoke(
        &mut self,
        name: &str,
        campaign_sync_id: &str,
        args: &[InspectionValue],
    ) -> InspectionValue {
        match self.functions.get_mut(name) {
            Some(function) => match function.invoke(campaign_sync_id, args) {
                Ok(value) => value,
                Err(e) => {
                    debug!(name, campaign = campaign_sync_id, error = %e, "Custom function error");
                    InspectionValue::Undefined
                }
            },
            None => {
                debug!(name, "Unknown custom function");
                InspectionValue::Undefined
            }
        }
    }
}
