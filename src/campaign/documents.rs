//! Cloud-issued campaign documents
//!
//! Wire decoding for the campaign list (collection schemes) and the state
//! template diff. A malformed document is discarded whole; the previously
//! accepted state stays in force.

use crate::expression::ConditionNode;
use crate::types::{SignalId, SyncId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Document decode errors.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document decode failed: {0}")]
    DecodeFailed(#[from] serde_json::Error),

    #[error("campaign list contains duplicate sync_id {0}")]
    DuplicateCampaign(SyncId),
}

/// When a condition-based campaign is allowed to fire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Fire on every satisfied evaluation (rate limit permitting).
    Always,
    /// Fire only on a `false|undefined → true` transition.
    RisingEdge,
}

/// What causes a campaign to fire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Fires every `period_ms` regardless of signal values.
    TimeBased { period_ms: u64 },
    /// Fires when the condition tree evaluates to true, subject to the
    /// trigger mode and minimum interval.
    ConditionBased {
        tree: ConditionNode,
        #[serde(default)]
        min_interval_ms: u64,
        mode: TriggerMode,
    },
}

/// Per-signal collection requirement declared by a campaign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalRequirement {
    pub signal_id: SignalId,
    /// Ring buffer depth snapshotted into the triggered bundle.
    pub sample_buffer_size: u32,
    /// Samples arriving faster than this are thinned before buffering.
    #[serde(default)]
    pub minimum_sample_period_ms: u64,
    /// Non-zero allocates a fixed-window aggregator of this period.
    #[serde(default)]
    pub fixed_window_period_ms: u64,
    /// Signal feeds the condition only; excluded from the snapshot.
    #[serde(default)]
    pub condition_only: bool,
}

/// One cloud campaign (collection scheme).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Campaign {
    pub sync_id: SyncId,
    /// Campaign activates only while this manifest is the active one.
    pub decoder_manifest_sync_id: SyncId,
    /// Absolute activation window, epoch milliseconds.
    pub start_ms: u64,
    pub expiry_ms: u64,
    pub trigger: TriggerKind,
    /// Delay between fire and snapshot, buffers keep filling meanwhile.
    #[serde(default)]
    pub after_duration_ms: u64,
    #[serde(default)]
    pub include_active_dtcs: bool,
    pub signal_requirements: Vec<SignalRequirement>,
    /// Lower number wins concurrent-fire tie-breaks.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub persist_all_collected_data: bool,
    #[serde(default)]
    pub compress_collected_data: bool,
}

impl Campaign {
    /// Signals referenced by the condition tree, if any.
    pub fn condition_signals(&self) -> HashSet<SignalId> {
        let mut refs = HashSet::new();
        if let TriggerKind::ConditionBased { tree, .. } = &self.trigger {
            crate::expression::collect_signal_refs(tree, &mut refs);
        }
        refs
    }
}

/// The campaign list document. Replaces the prior list on receipt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CampaignList {
    pub campaigns: Vec<Campaign>,
}

impl CampaignList {
    pub fn from_json(bytes: &[u8]) -> Result<Self, DocumentError> {
        let list: CampaignList = serde_json::from_slice(bytes)?;
        let mut seen = HashSet::new();
        for campaign in &list.campaigns {
            if !seen.insert(campaign.sync_id.clone()) {
                return Err(DocumentError::DuplicateCampaign(campaign.sync_id.clone()));
            }
        }
        Ok(list)
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// State template diff document.
///
/// Applied only when `version` is strictly greater than the last accepted
/// version; a remove of an unknown id is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateTemplatesDiff {
    pub version: u64,
    #[serde(default)]
    pub added: Vec<SyncId>,
    #[serde(default)]
    pub removed: Vec<SyncId>,
}

impl StateTemplatesDiff {
    pub fn from_json(bytes: &[u8]) -> Result<Self, DocumentError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// The agent's accepted set of state templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateTemplateSet {
    pub version: u64,
    pub ids: Vec<SyncId>,
}

impl StateTemplateSet {
    /// Apply a diff under the version gate. Returns true when the set
    /// changed.
    pub fn apply(&mut self, diff: &StateTemplatesDiff) -> bool {
        if diff.version < self.version {
            return false;
        }
        let mut changed = diff.version > self.version;
        self.version = diff.version;

        for id in &diff.added {
            if !self.ids.contains(id) {
                self.ids.push(id.clone());
                changed = true;
            }
        }
        for id in &diff.removed {
            if let Some(pos) = self.ids.iter().position(|x| x == id) {
                self.ids.remove(pos);
                changed = true;
            }
        }
        changed
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, DocumentError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
