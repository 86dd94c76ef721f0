//! Campaign lifecycle state machine
//!
//! Transitions are time-driven (wall-clock epoch ms against the campaign's
//! start/expiry window) and event-driven (list replaced, manifest swapped).
//! A campaign is eligible to run only while its declared manifest is the
//! active one and its condition tree type-checks against it.

use super::documents::{Campaign, TriggerKind};
use crate::decoder::DecoderManifest;
use crate::expression::{typecheck, TypecheckError};
use tracing::{debug, warn};

/// Lifecycle position of one campaign. Removal is not a state — removed
/// campaigns leave the list immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignState {
    /// Not runnable: manifest mismatch or not yet validated.
    Inactive,
    /// Validated, waiting for the start of its window.
    PendingStart,
    /// Running; the inspection matrix carries it.
    Active,
    /// Past expiry; waits for the cloud to drop it from the list.
    Expired,
}

/// Why a refresh dropped a campaign from the list.
#[derive(Debug, PartialEq, Eq)]
pub enum DropReason {
    TypecheckFailed(TypecheckError),
}

/// Outcome of one lifecycle refresh of a record.
#[derive(Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Unchanged,
    Changed,
    /// Campaign is invalid and must leave the list.
    Drop(DropReason),
}

/// A campaign plus its lifecycle state.
#[derive(Debug, Clone)]
pub struct CampaignRecord {
    pub campaign: Campaign,
    pub state: CampaignState,
    /// Condition tree has type-checked against the active manifest.
    /// Reset on every manifest swap.
    validated: bool,
}

impl CampaignRecord {
    pub fn new(campaign: Campaign) -> Self {
        Self {
            campaign,
            state: CampaignState::Inactive,
            validated: false,
        }
    }

    /// Force back to Inactive (manifest swapped away). The record re-enters
    /// the lifecycle once a matching manifest is active.
    pub fn deactivate(&mut self) -> bool {
        self.validated = false;
        if self.state != CampaignState::Inactive {
            self.state = CampaignState::Inactive;
            return true;
        }
        false
    }

    /// Drive the record toward the state implied by `now_ms` and the
    /// active manifest.
    pub fn refresh(&mut self, now_ms: u64, manifest: Option<&DecoderManifest>) -> RefreshOutcome {
        let next = match self.desired_state(now_ms, manifest) {
            Ok(state) => state,
            Err(err) => {
                warn!(
                    campaign = %self.campaign.sync_id,
                    error = %err,
                    "Campaign condition rejected — dropping campaign"
                );
                return RefreshOutcome::Drop(DropReason::TypecheckFailed(err));
            }
        };

        if next == self.state {
            return RefreshOutcome::Unchanged;
        }
        debug!(
            campaign = %self.campaign.sync_id,
            from = ?self.state,
            to = ?next,
            "Campaign state transition"
        );
        self.state = next;
        RefreshOutcome::Changed
    }

    fn desired_state(
        &mut self,
        now_ms: u64,
        manifest: Option<&DecoderManifest>,
    ) -> Result<CampaignState, TypecheckError> {
        let Some(manifest) = manifest else {
            return Ok(CampaignState::Inactive);
        };
        if manifest.sync_id != self.campaign.decoder_manifest_sync_id {
            // Kept inactive, logged by the manager once per swap.
            return Ok(CampaignState::Inactive);
        }

        if !self.validated {
            if let TriggerKind::ConditionBased { tree, .. } = &self.campaign.trigger {
                typecheck(tree, manifest)?;
            }
            self.validated = true;
        }

        if now_ms >= self.campaign.expiry_ms {
            return Ok(CampaignState::Expired);
        }
        if now_ms < self.campaign.start_ms {
            return Ok(CampaignState::PendingStart);
        }
        Ok(CampaignState::Active)
    }

    /// The next wall-clock instant at which this record's state can change
    /// on its own.
    pub fn next_deadline(&self) -> Option<u64> {
        match self.state {
            CampaignState::PendingStart => Some(self.campaign.start_ms),
            CampaignState::Active => Some(self.campaign.expiry_ms),
            CampaignState::Inactive | CampaignState::Expired => None,
        }
    }

    /// Whether this record belongs in the checkin report: anything
    /// validated against the active manifest, running or not yet started.
    pub fn reportable(&self) -> bool {
        matches!(self.state, CampaignState::PendingStart | CampaignState::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::documents::{SignalRequirement, TriggerMode};
    use crate::decoder::{SignalDecoderRule, SignalSource};
    use crate::expression::{CompareOp, ConditionNode};
    use crate::types::SignalType;

    fn manifest(sync_id: &str) -> DecoderManifest {
        DecoderManifest {
            sync_id: sync_id.to_string(),
            signals: vec![SignalDecoderRule {
                signal_id: 1,
                signal_type: SignalType::Float64,
                source: SignalSource::Custom { name: "speed".to_string() },
            }],
        }
    }

    fn condition_campaign(sync_id: &str, manifest_id: &str, signal_id: u32) -> Campaign {
        Campaign {
            sync_id: sync_id.to_string(),
            decoder_manifest_sync_id: manifest_id.to_string(),
            start_ms: 1_000,
            expiry_ms: 10_000,
            trigger: crate::campaign::documents::TriggerKind::ConditionBased {
                tree: ConditionNode::Comparison {
                    op: CompareOp::Gt,
                    left: Box::new(ConditionNode::SignalRef { signal_id }),
                    right: Box::new(ConditionNode::NumberLiteral { value: 50.0 }),
                },
                min_interval_ms: 0,
                mode: TriggerMode::RisingEdge,
            },
            after_duration_ms: 0,
            include_active_dtcs: false,
            signal_requirements: vec![SignalRequirement {
                signal_id,
                sample_buffer_size: 5,
                minimum_sample_period_ms: 0,
                fixed_window_period_ms: 0,
                condition_only: false,
            }],
            priority: 0,
            persist_all_collected_data: false,
            compress_collected_data: false,
        }
    }

    #[test]
    fn test_lifecycle_progression() {
        let dm = manifest("DM1");
        let mut record = CampaignRecord::new(condition_campaign("C1", "DM1", 1));

        assert_eq!(record.refresh(500, Some(&dm)), RefreshOutcome::Changed);
        assert_eq!(record.state, CampaignState::PendingStart);
        assert_eq!(record.next_deadline(), Some(1_000));

        assert_eq!(record.refresh(1_000, Some(&dm)), RefreshOutcome::Changed);
        assert_eq!(record.state, CampaignState::Active);
        assert_eq!(record.next_deadline(), Some(10_000));

        assert_eq!(record.refresh(10_000, Some(&dm)), RefreshOutcome::Changed);
        assert_eq!(record.state, CampaignState::Expired);
        assert_eq!(record.next_deadline(), None);
    }

    #[test]
    fn test_manifest_mismatch_keeps_inactive() {
        let dm2 = manifest("DM2");
        let mut record = CampaignRecord::new(condition_campaign("C1", "DM1", 1));

        assert_eq!(record.refresh(5_000, Some(&dm2)), RefreshOutcome::Unchanged);
        assert_eq!(record.state, CampaignState::Inactive);
    }

    #[test]
    fn test_manifest_swap_deactivates() {
        let dm = manifest("DM1");
        let mut record = CampaignRecord::new(condition_campaign("C1", "DM1", 1));
        record.refresh(5_000, Some(&dm));
        assert_eq!(record.state, CampaignState::Active);

        assert!(record.deactivate());
        assert_eq!(record.state, CampaignState::Inactive);

        // Re-validates and re-activates once the matching manifest returns.
        assert_eq!(record.refresh(5_000, Some(&dm)), RefreshOutcome::Changed);
        assert_eq!(record.state, CampaignState::Active);
    }

    #[test]
    fn test_typecheck_failure_drops_campaign() {
        let dm = manifest("DM1");
        // References signal 99 which DM1 does not declare.
        let mut record = CampaignRecord::new(condition_campaign("C1", "DM1", 99));

        match record.refresh(5_000, Some(&dm)) {
            RefreshOutcome::Drop(DropReason::TypecheckFailed(TypecheckError::UnknownSignal(99))) => {}
            other => panic!("expected drop, got {:?}", other),
        }
    }

    #[test]
    fn test_no_manifest_means_inactive() {
        let mut record = CampaignRecord::new(condition_campaign("C1", "DM1", 1));
        assert_eq!(record.refresh(5_000, None), RefreshOutcome::Unchanged);
        assert_eq!(record.state, CampaignState::Inactive);
    }
}
