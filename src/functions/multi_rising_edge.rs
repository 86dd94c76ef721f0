//! Multi-rising-edge trigger
//!
//! Arguments are pairs of `(label, flag)`. The function remembers each
//! label's previous flag per campaign; a `false → true` transition records
//! the label. At `condition_end` — if any labels were recorded, the tagged
//! output signal is in the collected set, and a raw-data quota exists for
//! it — it emits one complex-data signal whose payload is a JSON array of
//! the risen labels.

use super::{ContributedSignal, CustomFunction, FunctionError};
use crate::expression::InspectionValue;
use crate::rawdata::RawDataBufferManager;
use crate::types::SignalId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-campaign edge memory and recorded labels.
#[derive(Default)]
struct CampaignEdges {
    previous: HashMap<String, bool>,
    risen: Vec<String>,
}

pub struct MultiRisingEdgeTrigger {
    /// Signal the JSON label array is emitted as.
    output_signal_id: SignalId,
    rawdata: Arc<RawDataBufferManager>,
    campaigns: HashMap<String, CampaignEdges>,
}

impl MultiRisingEdgeTrigger {
    pub fn new(output_signal_id: SignalId, rawdata: Arc<RawDataBufferManager>) -> Self {
        Self {
            output_signal_id,
            rawdata,
            campaigns: HashMap::new(),
        }
    }

    /// Validate and destructure the `(label, flag)` argument pairs without
    /// touching state.
    fn parse_args(args: &[InspectionValue]) -> Result<Vec<(&str, bool)>, FunctionError> {
        if args.is_empty() || args.len() % 2 != 0 {
            return Err(FunctionError::TypeMismatch);
        }
        let mut pairs = Vec::with_capacity(args.len() / 2);
        for pair in args.chunks(2) {
            match (&pair[0], &pair[1]) {
                (InspectionValue::String(label), InspectionValue::Bool(flag)) => {
                    pairs.push((label.as_str(), *flag));
                }
                _ => return Err(FunctionError::TypeMismatch),
            }
        }
        Ok(pairs)
    }
}

impl CustomFunction for MultiRisingEdgeTrigger {
    fn invoke(
        &mut self,
        campaign_sync_id: &str,
        args: &[InspectionValue],
    ) -> Result<InspectionValue, FunctionError> {
        // Arity/type errors leave edge memory untouched.
        let pairs = Self::parse_args(args)?;

        let edges = self.campaigns.entry(campaign_sync_id.to_string()).or_default();
        let mut any_rose = false;
        for (label, flag) in pairs {
            let prev = edges.previous.insert(label.to_string(), flag).unwrap_or(false);
            if flag && !prev {
                edges.risen.push(label.to_string());
                any_rose = true;
            }
        }
        Ok(InspectionValue::Bool(any_rose))
    }

    fn condition_end(
        &mut self,
        campaign_sync_id: &str,
        collected_signals: &HashSet<SignalId>,
        _timestamp_ms: u64,
    ) -> Option<ContributedSignal> {
        let edges = self.campaigns.get_mut(campaign_sync_id)?;
        if edges.risen.is_empty() {
            return None;
        }
        // The labels are consumed whether or not the emission below
        // succeeds, and their edge memory is re-armed: a flag held high
        // across an emission counts as a fresh rising edge next pass.
        let risen = std::mem::take(&mut edges.risen);
        for label in &risen {
            edges.previous.insert(label.clone(), false);
        }

        if !collected_signals.contains(&self.output_signal_id) {
            debug!(
                campaign = campaign_sync_id,
                signal_id = self.output_signal_id,
                "Output signal not collected — suppressing label emission"
            );
            return None;
        }

        let payload = serde_json::to_vec(&risen).unwrap_or_default();
        match self.rawdata.store(self.output_signal_id, &payload) {
            Ok(handle) => Some(ContributedSignal {
                signal_id: self.output_signal_id,
                handle,
            }),
            Err(e) => {
                warn!(
                    campaign = campaign_sync_id,
                    signal_id = self.output_signal_id,
                    error = %e,
                    "Label payload not stored — suppressing emission"
                );
                None
            }
        }
    }

    fn cleanup(&mut self, campaign_sync_id: &str) {
        self.campaigns.remove(campaign_sync_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RawDataBufferConfig, RawSignalBufferConfig};

    fn rawdata_with_config(signal_id: SignalId) -> Arc<RawDataBufferManager> {
        Arc::new(RawDataBufferManager::new(&RawDataBufferConfig {
            global_max_bytes: 4096,
            signals: vec![RawSignalBufferConfig {
                signal_id,
                reserved_bytes: 0,
                max_bytes: 1024,
                max_samples: 8,
                max_bytes_per_sample: 256,
            }],
        }))
    }

    fn args(pairs: &[(&str, bool)]) -> Vec<InspectionValue> {
        pairs
            .iter()
            .flat_map(|(label, flag)| {
                [
                    InspectionValue::String(label.to_string()),
                    InspectionValue::Bool(*flag),
                ]
            })
            .collect()
    }

    fn payload_of(rawdata: &RawDataBufferManager, contributed: ContributedSignal) -> Vec<String> {
        let view = rawdata
            .borrow(contributed.signal_id, contributed.handle)
            .unwrap();
        let labels: Vec<String> = serde_json::from_slice(view.bytes()).unwrap();
        rawdata.release(contributed.signal_id, contributed.handle);
        labels
    }

    #[test]
    fn test_rising_edges_collect_labels() {
        let rawdata = rawdata_with_config(1);
        let mut f = MultiRisingEdgeTrigger::new(1, rawdata.clone());
        let collected: HashSet<SignalId> = [1].into_iter().collect();

        // All flags low: nothing fires, nothing emitted.
        assert_eq!(
            f.invoke("C1", &args(&[("abc", false), ("def", false)])).unwrap(),
            InspectionValue::Bool(false)
        );
        assert!(f.condition_end("C1", &collected, 100).is_none());

        // abc rises.
        assert_eq!(
            f.invoke("C1", &args(&[("abc", true), ("def", false)])).unwrap(),
            InspectionValue::Bool(true)
        );
        let contributed = f.condition_end("C1", &collected, 200).unwrap();
        assert_eq!(payload_of(&rawdata, contributed), vec!["abc"]);

        // def rises while abc falls.
        f.invoke("C1", &args(&[("abc", false), ("def", true)])).unwrap();
        let contributed = f.condition_end("C1", &collected, 300).unwrap();
        assert_eq!(payload_of(&rawdata, contributed), vec!["def"]);

        // Both rise together.
        f.invoke("C1", &args(&[("abc", true), ("def", true)])).unwrap();
        let contributed = f.condition_end("C1", &collected, 400).unwrap();
        assert_eq!(payload_of(&rawdata, contributed), vec!["abc", "def"]);
    }

    #[test]
    fn test_type_mismatch_leaves_state_unchanged() {
        let rawdata = rawdata_with_config(1);
        let mut f = MultiRisingEdgeTrigger::new(1, rawdata);

        f.invoke("C1", &args(&[("abc", false)])).unwrap();

        // Odd arity and wrong types are rejected.
        assert_eq!(
            f.invoke("C1", &[InspectionValue::String("abc".to_string())]),
            Err(FunctionError::TypeMismatch)
        );
        assert_eq!(
            f.invoke("C1", &[InspectionValue::Bool(true), InspectionValue::Bool(true)]),
            Err(FunctionError::TypeMismatch)
        );

        // The earlier false is still the remembered state: a true now is
        // still a rising edge.
        assert_eq!(
            f.invoke("C1", &args(&[("abc", true)])).unwrap(),
            InspectionValue::Bool(true)
        );
    }

    #[test]
    fn test_uncollected_output_signal_suppresses_emission() {
        let rawdata = rawdata_with_config(1);
        let mut f = MultiRisingEdgeTrigger::new(1, rawdata);

        f.invoke("C1", &args(&[("abc", true)])).unwrap();
        // Signal 1 not in the collected set.
        assert!(f.condition_end("C1", &HashSet::new(), 100).is_none());
    }

    #[test]
    fn test_missing_raw_config_suppresses_emission() {
        // Quota exists only for signal 9; the function outputs on 1.
        let rawdata = rawdata_with_config(9);
        let mut f = MultiRisingEdgeTrigger::new(1, rawdata);
        let collected: HashSet<SignalId> = [1].into_iter().collect();

        f.invoke("C1", &args(&[("abc", true)])).unwrap();
        assert!(f.condition_end("C1", &collected, 100).is_none());
    }

    #[test]
    fn test_per_campaign_isolation_and_cleanup() {
        let rawdata = rawdata_with_config(1);
        let mut f = MultiRisingEdgeTrigger::new(1, rawdata);

        f.invoke("C1", &args(&[("abc", true)])).unwrap();
        // C2 has its own edge memory; same input is a fresh rising edge.
        assert_eq!(
            f.invoke("C2", &args(&[("abc", true)])).unwrap(),
            InspectionValue::Bool(true)
        );

        f.cleanup("C1");
        // After cleanup the label memory is gone: true is a rising edge
        // again for C1.
        assert_eq!(
            f.invoke("C1", &args(&[("abc", true)])).unwrap(),
            InspectionValue::Bool(true)
        );
    }
}
