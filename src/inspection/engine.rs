//! Inspection engine — single-threaded consumer of the signal pipeline
//!
//! On each sample: update the signal's ring buffer and fixed windows, then
//! evaluate every campaign whose condition reads that signal, exactly once,
//! before the next sample from the same producer is taken. Fires assemble
//! a triggered bundle from the buffered history, immediately or after the
//! campaign's post-trigger duration.

use super::buffers::SignalBufferSet;
use crate::campaign::{CampaignRuntime, InspectionMatrix, TriggerKind, TriggerMode};
use crate::clock::Clock;
use crate::dtc::DtcSource;
use crate::expression::{evaluate, EvalContext, InspectionValue};
use crate::functions::{ContributedSignal, FunctionRegistry};
use crate::rawdata::RawDataBufferManager;
use crate::types::{
    CollectedSignal, RawDataRef, SignalSample, SignalValue, SyncId, TriggeredData,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-campaign trigger bookkeeping.
struct TriggerState {
    /// Result of the previous evaluation pass; seeds rising-edge checks.
    previous: InspectionValue,
    /// Monotonic time of the last fire, for the minimum interval.
    last_fire_mono: Option<u64>,
    /// Next scheduled fire for time-based campaigns (monotonic).
    next_time_fire_mono: Option<u64>,
    /// Custom-function contributions collected at evaluation passes,
    /// pinned in the raw buffer until the next fire's bundle consumes
    /// them.
    contributions: Vec<ContributedSignal>,
}

/// A fire whose snapshot is deferred by `after_duration_ms`.
struct PendingTrigger {
    campaign_sync_id: SyncId,
    priority: u32,
    trigger_ts: u64,
    due_mono: u64,
}

pub struct InspectionEngine {
    clock: Arc<dyn Clock>,
    rawdata: Arc<RawDataBufferManager>,
    dtc: Arc<dyn DtcSource>,
    functions: FunctionRegistry,

    samples_rx: mpsc::Receiver<SignalSample>,
    matrix_rx: watch::Receiver<Arc<InspectionMatrix>>,
    output_tx: mpsc::Sender<TriggeredData>,
    idle_time_ms: u64,

    signals: SignalBufferSet,
    matrix: Arc<InspectionMatrix>,
    states: HashMap<SyncId, TriggerState>,
    pending: Vec<PendingTrigger>,

    samples_processed: u64,
    triggers_fired: u64,
    payloads_dropped: u64,
}

impl InspectionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn Clock>,
        rawdata: Arc<RawDataBufferManager>,
        dtc: Arc<dyn DtcSource>,
        functions: FunctionRegistry,
        samples_rx: mpsc::Receiver<SignalSample>,
        matrix_rx: watch::Receiver<Arc<InspectionMatrix>>,
        output_tx: mpsc::Sender<TriggeredData>,
        idle_time_ms: u64,
    ) -> Self {
        Self {
            clock,
            rawdata,
            dtc,
            functions,
            samples_rx,
            matrix_rx,
            output_tx,
            idle_time_ms,
            signals: SignalBufferSet::new(),
            matrix: Arc::new(InspectionMatrix::default()),
            states: HashMap::new(),
            pending: Vec::new(),
            samples_processed: 0,
            triggers_fired: 0,
            payloads_dropped: 0,
        }
    }

    /// Run until cancelled or the pipeline closes.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Inspection engine started");
        let initial = self.matrix_rx.borrow_and_update().clone();
        self.apply_matrix(initial);

        loop {
            let wait = self.next_wait();
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = self.matrix_rx.changed() => {
                    if changed.is_err() {
                        break; // manager gone
                    }
                    let matrix = self.matrix_rx.borrow_and_update().clone();
                    self.apply_matrix(matrix);
                }
                sample = self.samples_rx.recv() => {
                    match sample {
                        Some(sample) => self.process_sample(sample),
                        None => break, // distributor gone
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
            self.tick();
        }
        info!(
            samples = self.samples_processed,
            triggers = self.triggers_fired,
            dropped = self.payloads_dropped,
            "Inspection engine stopped"
        );
    }

    /// Queue wait bounded by the idle time and by the next scheduled fire.
    fn next_wait(&self) -> Duration {
        let now_mono = self.clock.monotonic_ms();
        let mut until = self.idle_time_ms;
        for state in self.states.values() {
            if let Some(next) = state.next_time_fire_mono {
                until = until.min(next.saturating_sub(now_mono));
            }
        }
        for pending in &self.pending {
            until = until.min(pending.due_mono.saturating_sub(now_mono));
        }
        Duration::from_millis(until.max(1))
    }

    /// Swap in a freshly published matrix: re-shape buffers, seed trigger
    /// state for new campaigns, clean up removed ones.
    fn apply_matrix(&mut self, matrix: Arc<InspectionMatrix>) {
        let now_mono = self.clock.monotonic_ms();
        let new_ids: HashSet<&SyncId> = matrix.campaigns.iter().map(|c| &c.sync_id).collect();

        let removed: Vec<SyncId> = self
            .states
            .keys()
            .filter(|id| !new_ids.contains(id))
            .cloned()
            .collect();
        for sync_id in removed {
            self.functions.cleanup(&sync_id);
            if let Some(state) = self.states.remove(&sync_id) {
                for c in state.contributions {
                    self.rawdata.release(c.signal_id, c.handle);
                }
            }
            self.pending.retain(|p| {
                if p.campaign_sync_id == sync_id {
                    debug!(campaign = %sync_id, "Dropping pending snapshot of removed campaign");
                    false
                } else {
                    true
                }
            });
        }

        for campaign in &matrix.campaigns {
            self.states
                .entry(campaign.sync_id.clone())
                .or_insert_with(|| TriggerState {
                    previous: InspectionValue::Undefined,
                    last_fire_mono: None,
                    next_time_fire_mono: match &campaign.trigger {
                        TriggerKind::TimeBased { period_ms } => Some(now_mono + *period_ms),
                        TriggerKind::ConditionBased { .. } => None,
                    },
                    contributions: Vec::new(),
                });
        }

        self.signals.reconfigure(&matrix.required_signals);
        debug!(campaigns = matrix.campaigns.len(), "Inspection matrix applied");
        self.matrix = matrix;
    }

    /// Ingest one sample and evaluate every campaign that watches it.
    fn process_sample(&mut self, sample: SignalSample) {
        self.samples_processed += 1;
        if !self.signals.tracks(sample.signal_id) {
            return; // not required by any active campaign
        }
        self.signals.ingest(&sample);

        let matrix = Arc::clone(&self.matrix);
        for campaign in matrix.campaigns_watching(sample.signal_id) {
            self.evaluate_campaign(campaign);
        }
    }

    /// Signals a fire of this campaign snapshots into its bundle.
    fn collected_ids(campaign: &CampaignRuntime) -> HashSet<u32> {
        campaign
            .signal_requirements
            .iter()
            .filter(|r| !r.condition_only)
            .map(|r| r.signal_id)
            .collect()
    }

    /// One evaluation pass for one campaign, with edge and rate-limit
    /// gating. Any failure inside folds to `Undefined` and the engine
    /// moves on.
    fn evaluate_campaign(&mut self, campaign: &CampaignRuntime) {
        let TriggerKind::ConditionBased {
            tree,
            min_interval_ms,
            mode,
        } = &campaign.trigger
        else {
            return;
        };

        let result = {
            let mut ctx = EvalContext {
                campaign_sync_id: &campaign.sync_id,
                signals: &self.signals,
                functions: &mut self.functions,
            };
            evaluate(tree, &mut ctx)
        };

        // Custom functions see the end of every evaluation pass, not just
        // firing ones. Whatever they contribute is pinned and rides along
        // with the next bundle this campaign assembles.
        let collected = Self::collected_ids(campaign);
        let pass_ts = self.clock.now_ms();
        let contributed = self
            .functions
            .condition_end(&campaign.sync_id, &collected, pass_ts);
        let mut pinned: Vec<ContributedSignal> = Vec::new();
        for c in contributed {
            if self.rawdata.borrow(c.signal_id, c.handle).is_some() {
                pinned.push(c);
            }
        }

        let Some(state) = self.states.get_mut(&campaign.sync_id) else {
            for c in pinned {
                self.rawdata.release(c.signal_id, c.handle);
            }
            return;
        };
        state.contributions.extend(pinned);
        let was_true = state.previous.is_true();
        state.previous = result.clone();

        let satisfied = match mode {
            // A fire needs the condition true right now; in rising-edge
            // mode additionally a non-true previous pass.
            TriggerMode::Always => result.is_true(),
            TriggerMode::RisingEdge => result.is_true() && !was_true,
        };
        if !satisfied {
            return;
        }

        let now_mono = self.clock.monotonic_ms();
        let interval_open = state
            .last_fire_mono
            .map_or(true, |last| now_mono.saturating_sub(last) >= *min_interval_ms);
        if !interval_open {
            return;
        }
        state.last_fire_mono = Some(now_mono);
        self.fire(campaign, now_mono);
    }

    /// A campaign fired: snapshot now, or defer by its after-duration.
    fn fire(&mut self, campaign: &CampaignRuntime, now_mono: u64) {
        self.triggers_fired += 1;
        let trigger_ts = self.clock.now_ms();
        debug!(
            campaign = %campaign.sync_id,
            trigger_ts,
            after_duration_ms = campaign.after_duration_ms,
            "Campaign triggered"
        );

        // A higher-priority fire supersedes waiting snapshots: they are
        // assembled immediately so the new fire is not delayed behind them.
        let superseded: Vec<PendingTrigger> = {
            let (cut, keep) = self
                .pending
                .drain(..)
                .partition(|p| p.priority > campaign.priority);
            self.pending = keep;
            cut
        };
        for pending in superseded {
            self.assemble_pending(pending);
        }

        if campaign.after_duration_ms == 0 {
            self.assemble(campaign, trigger_ts);
        } else {
            self.pending.push(PendingTrigger {
                campaign_sync_id: campaign.sync_id.clone(),
                priority: campaign.priority,
                trigger_ts,
                due_mono: now_mono + campaign.after_duration_ms,
            });
        }
    }

    /// Scheduled work: time-based fires and due deferred snapshots.
    fn tick(&mut self) {
        let now_mono = self.clock.monotonic_ms();
        let matrix = Arc::clone(&self.matrix);

        // Time-based campaigns fire every period regardless of conditions.
        for campaign in &matrix.campaigns {
            let TriggerKind::TimeBased { period_ms } = &campaign.trigger else {
                continue;
            };
            let period_ms = *period_ms;
            let Some(state) = self.states.get_mut(&campaign.sync_id) else {
                continue;
            };
            let Some(next) = state.next_time_fire_mono else {
                continue;
            };
            if now_mono < next {
                continue;
            }
            // Catch up without bursting after a stall.
            let mut next = next;
            while next <= now_mono {
                next += period_ms.max(1);
            }
            state.next_time_fire_mono = Some(next);
            state.last_fire_mono = Some(now_mono);
            self.fire(campaign, now_mono);
        }

        // Deferred snapshots, in the concurrent-fire tie-break order.
        let mut due: Vec<PendingTrigger> = Vec::new();
        self.pending.retain_mut(|p| {
            if p.due_mono <= now_mono {
                due.push(PendingTrigger {
                    campaign_sync_id: std::mem::take(&mut p.campaign_sync_id),
                    priority: p.priority,
                    trigger_ts: p.trigger_ts,
                    due_mono: p.due_mono,
                });
                false
            } else {
                true
            }
        });
        due.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.campaign_sync_id.cmp(&b.campaign_sync_id))
        });
        for pending in due {
            self.assemble_pending(pending);
        }
    }

    fn assemble_pending(&mut self, pending: PendingTrigger) {
        let matrix = Arc::clone(&self.matrix);
        let Some(campaign) = matrix
            .campaigns
            .iter()
            .find(|c| c.sync_id == pending.campaign_sync_id)
        else {
            return; // campaign left the matrix while waiting
        };
        self.assemble(campaign, pending.trigger_ts);
    }

    /// Build the triggered bundle: the buffered history of every collected
    /// signal, raw-data handles still borrowable, custom-function
    /// contributions, and the DTC snapshot when asked for.
    fn assemble(&mut self, campaign: &CampaignRuntime, trigger_ts: u64) {
        let mut signals: Vec<CollectedSignal> = Vec::new();
        let mut raw_data_refs: Vec<RawDataRef> = Vec::new();

        for req in &campaign.signal_requirements {
            if req.condition_only {
                continue;
            }
            for sample in self.signals.snapshot(
                req.signal_id,
                req.sample_buffer_size,
                req.minimum_sample_period_ms,
            ) {
                if let SignalValue::RawHandle(handle) = sample.value {
                    // Keep the frame alive until the uploader releases it.
                    // Evicted or unstored complex data is silently absent
                    // from the bundle.
                    if self.rawdata.borrow(req.signal_id, handle).is_none() {
                        continue;
                    }
                    raw_data_refs.push(RawDataRef {
                        signal_id: req.signal_id,
                        handle,
                    });
                }
                signals.push(CollectedSignal {
                    signal_id: sample.signal_id,
                    timestamp_ms: sample.timestamp_ms,
                    value: sample.value,
                });
            }
        }

        // Custom-function contributions gathered at evaluation passes
        // since the last fire; already pinned, so no fresh borrow here.
        let contributions = self
            .states
            .get_mut(&campaign.sync_id)
            .map(|s| std::mem::take(&mut s.contributions))
            .unwrap_or_default();
        for contributed in contributions {
            raw_data_refs.push(RawDataRef {
                signal_id: contributed.signal_id,
                handle: contributed.handle,
            });
            signals.push(CollectedSignal {
                signal_id: contributed.signal_id,
                timestamp_ms: trigger_ts,
                value: SignalValue::RawHandle(contributed.handle),
            });
        }

        let data = TriggeredData {
            campaign_sync_id: campaign.sync_id.clone(),
            trigger_ts,
            signals,
            raw_data_refs,
            active_dtcs: campaign
                .include_active_dtcs
                .then(|| self.dtc.active_dtcs()),
            compress: campaign.compress_collected_data,
            persist: campaign.persist_all_collected_data,
        };

        match self.output_tx.try_send(data) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(data))
            | Err(mpsc::error::TrySendError::Closed(data)) => {
                self.payloads_dropped += 1;
                warn!(
                    campaign = %data.campaign_sync_id,
                    dropped_total = self.payloads_dropped,
                    "Upload queue unavailable — dropping triggered data"
                );
                // The borrows taken above must not leak with the bundle.
                for r in &data.raw_data_refs {
                    self.rawdata.release(r.signal_id, r.handle);
                }
            }
        }
    }
}
