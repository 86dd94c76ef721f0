//! Inspection matrix — the engine-facing consolidation of active campaigns
//!
//! Regenerated whole on any campaign or manifest change and published as an
//! immutable snapshot; the engine never observes a partial update.

use super::documents::{SignalRequirement, TriggerKind};
use crate::types::{SignalId, SyncId};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Runtime view of one active campaign.
#[derive(Debug, Clone)]
pub struct CampaignRuntime {
    pub sync_id: SyncId,
    pub trigger: TriggerKind,
    pub after_duration_ms: u64,
    pub include_active_dtcs: bool,
    pub signal_requirements: Vec<SignalRequirement>,
    pub priority: u32,
    pub persist_all_collected_data: bool,
    pub compress_collected_data: bool,
    /// Signals the condition tree reads; evaluation is keyed off these.
    pub condition_signals: HashSet<SignalId>,
}

/// Buffering the engine must maintain for one signal, unioned across all
/// active campaigns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalNeed {
    /// Deepest ring buffer any campaign asks for.
    pub max_sample_buffer: u32,
    /// Fixed-window periods referenced by at least one campaign.
    pub window_periods_ms: BTreeSet<u64>,
}

/// Immutable evaluation plan for the inspection engine.
#[derive(Debug, Clone, Default)]
pub struct InspectionMatrix {
    /// Stable order: priority ascending, then sync_id — the concurrent-fire
    /// tie-break order.
    pub campaigns: Vec<CampaignRuntime>,
    pub required_signals: HashMap<SignalId, SignalNeed>,
}

impl InspectionMatrix {
    /// Build from the currently active campaign runtimes.
    pub fn build(mut campaigns: Vec<CampaignRuntime>) -> Self {
        campaigns.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.sync_id.cmp(&b.sync_id))
        });

        let mut required_signals: HashMap<SignalId, SignalNeed> = HashMap::new();
        for campaign in &campaigns {
            for req in &campaign.signal_requirements {
                let need = required_signals.entry(req.signal_id).or_default();
                need.max_sample_buffer = need.max_sample_buffer.max(req.sample_buffer_size);
                if req.fixed_window_period_ms > 0 {
                    need.window_periods_ms.insert(req.fixed_window_period_ms);
                }
            }
            // Condition-only signals still need a buffer slot for the
            // latest value, but no snapshot depth beyond what's declared.
            for signal_id in &campaign.condition_signals {
                required_signals.entry(*signal_id).or_default();
            }
        }

        Self {
            campaigns,
            required_signals,
        }
    }

    /// Union of signal IDs the decoder dictionary must keep decoding.
    pub fn required_signal_ids(&self) -> HashSet<SignalId> {
        self.required_signals.keys().copied().collect()
    }

    /// Campaigns whose condition reads this signal.
    pub fn campaigns_watching(&self, signal_id: SignalId) -> impl Iterator<Item = &CampaignRuntime> {
        self.campaigns
            .iter()
            .filter(move |c| c.condition_signals.contains(&signal_id))
    }

    pub fn is_empty(&self) -> bool {
        self.campaigns.is_empty()
    }
}
