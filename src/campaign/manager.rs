//! Campaign manager task

use super::documents::{CampaignList, StateTemplateSet, StateTemplatesDiff};
use super::matrix::{CampaignRuntime, InspectionMatrix};
use super::state::{CampaignRecord, CampaignState, RefreshOutcome};
use crate::checkin::CheckinSnapshot;
use crate::clock::Clock;
use crate::decoder::{DecoderDictionary, DecoderManifest, DictionaryPublisher};
use crate::storage::{BlobKind, PersistenceAdapter, PersistenceError};
use crate::transport::InboundDocument;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Events that wake the manager outside its deadline schedule.
#[derive(Debug)]
pub enum ControlEvent {
    Document(InboundDocument),
}

/// Channel ends the rest of the agent uses to talk to a running manager.
pub struct CampaignManagerHandles {
    /// Feed control-plane documents here (document poller).
    pub events_tx: mpsc::Sender<ControlEvent>,
    /// Inspection matrix snapshots (inspection engine).
    pub matrix_rx: watch::Receiver<Arc<InspectionMatrix>>,
    /// Checkin snapshots; `None` until persisted state is restored.
    pub checkin_rx: watch::Receiver<Option<CheckinSnapshot>>,
}

/// Owner of campaign and manifest state. Single task; all mutation happens
/// inside `run`.
pub struct CampaignManager {
    clock: Arc<dyn Clock>,
    persistence: Arc<PersistenceAdapter>,
    dictionary: Arc<DictionaryPublisher>,
    idle_time_ms: u64,

    events_rx: mpsc::Receiver<ControlEvent>,
    matrix_tx: watch::Sender<Arc<InspectionMatrix>>,
    checkin_tx: watch::Sender<Option<CheckinSnapshot>>,

    records: Vec<CampaignRecord>,
    manifest: Option<DecoderManifest>,
    state_templates: StateTemplateSet,
}

impl CampaignManager {
    pub fn new(
        clock: Arc<dyn Clock>,
        persistence: Arc<PersistenceAdapter>,
        dictionary: Arc<DictionaryPublisher>,
        idle_time_ms: u64,
    ) -> (Self, CampaignManagerHandles) {
        let (events_tx, events_rx) = mpsc::channel(32);
        let (matrix_tx, matrix_rx) = watch::channel(Arc::new(InspectionMatrix::default()));
        let (checkin_tx, checkin_rx) = watch::channel(None);

        let manager = Self {
            clock,
            persistence,
            dictionary,
            idle_time_ms,
            events_rx,
            matrix_tx,
            checkin_tx,
            records: Vec::new(),
            manifest: None,
            state_templates: StateTemplateSet::default(),
        };
        let handles = CampaignManagerHandles {
            events_tx,
            matrix_rx,
            checkin_rx,
        };
        (manager, handles)
    }

    /// Run until cancelled. Restores persisted state before publishing the
    /// first checkin snapshot.
    pub async fn run(mut self, cancel: CancellationToken) {
        self.restore_persisted();
        self.lifecycle_pass();
        // First publication flips the checkin gate open, restored
        // documents and all.
        self.publish();
        info!(
            campaigns = self.records.len(),
            manifest = self.manifest.as_ref().map(|m| m.sync_id.as_str()).unwrap_or("-"),
            "Campaign manager started"
        );

        loop {
            let wait = self.next_wait();
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.events_rx.recv() => {
                    match event {
                        Some(ControlEvent::Document(document)) => {
                            let changed = self.apply_document(document, true);
                            let lifecycle_changed = self.lifecycle_pass();
                            if changed || lifecycle_changed {
                                self.publish();
                            }
                        }
                        None => break, // all senders gone
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    if self.lifecycle_pass() {
                        self.publish();
                    }
                }
            }
        }
        info!("Campaign manager stopped");
    }

    /// Time until the next earliest state change, capped by the idle time
    /// so wall-clock jumps and cancellation are noticed.
    fn next_wait(&self) -> Duration {
        let now = self.clock.now_ms();
        let next_deadline = self
            .records
            .iter()
            .filter_map(CampaignRecord::next_deadline)
            .min();

        let until = match next_deadline {
            Some(deadline) => deadline.saturating_sub(now).min(self.idle_time_ms),
            None => self.idle_time_ms,
        };
        // Zero would spin when a deadline is already due but the record
        // cannot advance (e.g. wall clock stepped backwards).
        Duration::from_millis(until.max(1))
    }

    // ------------------------------------------------------------------
    // Document application
    // ------------------------------------------------------------------

    /// Apply one inbound document. Returns true when agent state changed.
    /// Malformed documents are discarded whole; previous state is kept.
    fn apply_document(&mut self, document: InboundDocument, persist: bool) -> bool {
        match document {
            InboundDocument::DecoderManifest(bytes) => {
                match DecoderManifest::from_json(&bytes) {
                    Ok(manifest) => self.apply_manifest(manifest, persist, &bytes),
                    Err(e) => {
                        warn!(error = %e, "Decoder manifest rejected — keeping previous");
                        false
                    }
                }
            }
            InboundDocument::CollectionSchemes(bytes) => {
                match CampaignList::from_json(&bytes) {
                    Ok(list) => self.apply_campaign_list(list, persist, &bytes),
                    Err(e) => {
                        warn!(error = %e, "Campaign list rejected — keeping previous");
                        false
                    }
                }
            }
            InboundDocument::StateTemplates(bytes) => {
                match StateTemplatesDiff::from_json(&bytes) {
                    Ok(diff) => self.apply_state_templates(&diff, persist),
                    Err(e) => {
                        warn!(error = %e, "State template diff rejected — keeping previous");
                        false
                    }
                }
            }
        }
    }

    fn apply_manifest(
        &mut self,
        manifest: DecoderManifest,
        persist: bool,
        raw: &[u8],
    ) -> bool {
        let same = self
            .manifest
            .as_ref()
            .map(|m| m.sync_id == manifest.sync_id)
            .unwrap_or(false);
        if same {
            debug!(sync_id = %manifest.sync_id, "Decoder manifest unchanged");
            return false;
        }

        // Signals referenced by condition trees may have moved or changed
        // type: every campaign revalidates against the new manifest.
        let mut deactivated = 0;
        for record in &mut self.records {
            if record.deactivate() {
                deactivated += 1;
            }
        }
        info!(
            sync_id = %manifest.sync_id,
            signals = manifest.signals.len(),
            deactivated,
            "Decoder manifest activated"
        );
        self.manifest = Some(manifest);

        if persist {
            self.persist_blob(BlobKind::DecoderManifest, raw);
        }
        true
    }

    fn apply_campaign_list(&mut self, list: CampaignList, persist: bool, raw: &[u8]) -> bool {
        let active_manifest = self
            .manifest
            .as_ref()
            .map(|m| m.sync_id.clone())
            .unwrap_or_default();

        // Campaigns whose sync_id disappears leave immediately.
        let before = self.records.len();
        self.records.retain(|record| {
            let keep = list
                .campaigns
                .iter()
                .any(|c| c.sync_id == record.campaign.sync_id);
            if !keep {
                info!(campaign = %record.campaign.sync_id, "Campaign removed from list");
            }
            keep
        });
        let removed = before - self.records.len();

        // New sync_ids enter as inactive; a sync_id identifies one
        // immutable document version, so existing records are kept as-is.
        let mut added = 0;
        for campaign in list.campaigns {
            if self
                .records
                .iter()
                .any(|r| r.campaign.sync_id == campaign.sync_id)
            {
                continue;
            }
            if campaign.decoder_manifest_sync_id != active_manifest {
                warn!(
                    campaign = %campaign.sync_id,
                    wants = %campaign.decoder_manifest_sync_id,
                    active = %active_manifest,
                    "Campaign references inactive manifest — keeping inactive"
                );
            }
            self.records.push(CampaignRecord::new(campaign));
            added += 1;
        }

        info!(added, removed, total = self.records.len(), "Campaign list applied");
        if persist {
            self.persist_blob(BlobKind::CampaignList, raw);
        }
        added > 0 || removed > 0
    }

    fn apply_state_templates(&mut self, diff: &StateTemplatesDiff, persist: bool) -> bool {
        let changed = self.state_templates.apply(diff);
        if changed {
            info!(
                version = self.state_templates.version,
                templates = self.state_templates.ids.len(),
                "State templates updated"
            );
            if persist {
                // The accumulated set is persisted, not the diff, so a
                // restart restores the full membership.
                self.persist_blob(BlobKind::StateTemplates, &self.state_templates.to_json());
            }
        } else {
            debug!(version = diff.version, "State template diff ignored by version gate");
        }
        changed
    }

    /// Persist a document blob, evicting buffered payloads if the quota is
    /// hit — control documents outrank undelivered data.
    fn persist_blob(&self, kind: BlobKind, blob: &[u8]) {
        loop {
            match self.persistence.write(kind, blob) {
                Ok(()) => return,
                Err(PersistenceError::DiskFull { .. }) => {
                    let payloads = self.persistence.list_payloads();
                    match payloads.first() {
                        Some(oldest) => {
                            warn!(
                                kind = ?kind,
                                evicting = %oldest.display(),
                                "Persistence quota hit — evicting oldest payload"
                            );
                            self.persistence.delete_payload(oldest);
                        }
                        None => {
                            warn!(kind = ?kind, "Persistence quota hit — document not persisted");
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(kind = ?kind, error = %e, "Document persistence failed");
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Restore
    // ------------------------------------------------------------------

    /// Load the last-received documents from disk. Runs before the first
    /// checkin gate opens. Corrupt blobs are ignored and erased.
    fn restore_persisted(&mut self) {
        if let Some(bytes) = self.persistence.read(BlobKind::DecoderManifest) {
            match DecoderManifest::from_json(&bytes) {
                Ok(manifest) => {
                    self.apply_manifest(manifest, false, &bytes);
                }
                Err(e) => {
                    warn!(error = %e, "Persisted manifest corrupt — erasing");
                    self.persistence.erase(BlobKind::DecoderManifest);
                }
            }
        }
        if let Some(bytes) = self.persistence.read(BlobKind::CampaignList) {
            match CampaignList::from_json(&bytes) {
                Ok(list) => {
                    self.apply_campaign_list(list, false, &bytes);
                }
                Err(e) => {
                    warn!(error = %e, "Persisted campaign list corrupt — erasing");
                    self.persistence.erase(BlobKind::CampaignList);
                }
            }
        }
        if let Some(bytes) = self.persistence.read(BlobKind::StateTemplates) {
            match StateTemplateSet::from_json(&bytes) {
                Ok(set) => {
                    info!(version = set.version, templates = set.ids.len(), "State templates restored");
                    self.state_templates = set;
                }
                Err(e) => {
                    warn!(error = %e, "Persisted state templates corrupt — erasing");
                    self.persistence.erase(BlobKind::StateTemplates);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle and publication
    // ------------------------------------------------------------------

    /// Advance every record toward its time-implied state. Invalid
    /// campaigns drop out; one bad campaign never poisons the list.
    fn lifecycle_pass(&mut self) -> bool {
        let now = self.clock.now_ms();
        let manifest = self.manifest.clone();
        let mut changed = false;
        self.records.retain_mut(|record| {
            match record.refresh(now, manifest.as_ref()) {
                RefreshOutcome::Unchanged => true,
                RefreshOutcome::Changed => {
                    changed = true;
                    true
                }
                RefreshOutcome::Drop(reason) => {
                    warn!(
                        campaign = %record.campaign.sync_id,
                        reason = ?reason,
                        "Campaign dropped"
                    );
                    changed = true;
                    false
                }
            }
        });
        changed
    }

    /// Recompute and publish the inspection matrix, the filtered decoder
    /// dictionary, and the checkin snapshot. Each artifact swaps in whole.
    fn publish(&mut self) {
        let runtimes: Vec<CampaignRuntime> = self
            .records
            .iter()
            .filter(|r| r.state == CampaignState::Active)
            .map(|r| CampaignRuntime {
                sync_id: r.campaign.sync_id.clone(),
                trigger: r.campaign.trigger.clone(),
                after_duration_ms: r.campaign.after_duration_ms,
                include_active_dtcs: r.campaign.include_active_dtcs,
                signal_requirements: r.campaign.signal_requirements.clone(),
                priority: r.campaign.priority,
                persist_all_collected_data: r.campaign.persist_all_collected_data,
                compress_collected_data: r.campaign.compress_collected_data,
                condition_signals: r.campaign.condition_signals(),
            })
            .collect();
        let matrix = InspectionMatrix::build(runtimes);

        let dictionary = match &self.manifest {
            Some(manifest) => DecoderDictionary::build(manifest, &matrix.required_signal_ids()),
            None => DecoderDictionary::default(),
        };

        let mut sync_ids: Vec<String> = Vec::new();
        if let Some(manifest) = &self.manifest {
            sync_ids.push(manifest.sync_id.clone());
        }
        sync_ids.extend(
            self.records
                .iter()
                .filter(|r| r.reportable())
                .map(|r| r.campaign.sync_id.clone()),
        );
        sync_ids.extend(self.state_templates.ids.iter().cloned());

        debug!(
            active = matrix.campaigns.len(),
            required_signals = matrix.required_signals.len(),
            reporting = sync_ids.len(),
            "Publishing inspection matrix"
        );
        self.matrix_tx.send_replace(Arc::new(matrix));
        self.dictionary.publish(dictionary);
        self.checkin_tx
            .send_replace(Some(CheckinSnapshot { sync_ids }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::documents::{Campaign, SignalRequirement, TriggerKind};
    use crate::clock::ManualClock;
    use crate::decoder::{SignalDecoderRule, SignalSource};
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

    fn campaign(sync_id: &str, manifest_id: &str, start_ms: u64, expiry_ms: u64) -> Campaign {
        Campaign {
            sync_id: sync_id.to_string(),
            decoder_manifest_sync_id: manifest_id.to_string(),
            start_ms,
            expiry_ms,
            trigger: TriggerKind::TimeBased { period_ms: 1_000 },
            after_duration_ms: 0,
            include_active_dtcs: false,
            signal_requirements: vec![SignalRequirement {
                signal_id: 1,
                sample_buffer_size: 10,
                minimum_sample_period_ms: 0,
                fixed_window_period_ms: 0,
                condition_only: false,
            }],
            priority: 0,
            persist_all_collected_data: false,
            compress_collected_data: false,
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        clock: Arc<ManualClock>,
        persistence: Arc<PersistenceAdapter>,
        dictionary: Arc<DictionaryPublisher>,
    }

    impl Fixture {
        fn new(start_ms: u64) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let persistence =
                Arc::new(PersistenceAdapter::open(tmp.path().join("persist"), 64 * 1024).unwrap());
            Self {
                _tmp: tmp,
                clock: ManualClock::new(start_ms),
                persistence,
                dictionary: Arc::new(DictionaryPublisher::new()),
            }
        }

        fn manager(&self) -> (CampaignManager, CampaignManagerHandles) {
            CampaignManager::new(
                self.clock.clone(),
                self.persistence.clone(),
                self.dictionary.clone(),
                50,
            )
        }
    }

    fn checkin_ids(handles: &CampaignManagerHandles) -> Vec<String> {
        handles
            .checkin_rx
            .borrow()
            .as_ref()
            .map(|s| {
                let mut ids = s.sync_ids.clone();
                ids.sort();
                ids
            })
            .unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_campaign_activates_and_publishes_matrix() {
        let fixture = Fixture::new(5_000);
        let (manager, mut handles) = fixture.manager();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(manager.run(cancel.clone()));

        handles
            .events_tx
            .send(ControlEvent::Document(InboundDocument::DecoderManifest(
                manifest("DM1").to_json(),
            )))
            .await
            .unwrap();
        handles
            .events_tx
            .send(ControlEvent::Document(InboundDocument::CollectionSchemes(
                CampaignList {
                    campaigns: vec![campaign("C1", "DM1", 0, 100_000)],
                }
                .to_json(),
            )))
            .await
            .unwrap();

        // Wait for the matrix to carry the active campaign.
        loop {
            handles.matrix_rx.changed().await.unwrap();
            if !handles.matrix_rx.borrow().is_empty() {
                break;
            }
        }

        assert_eq!(handles.matrix_rx.borrow().campaigns[0].sync_id, "C1");
        assert_eq!(checkin_ids(&handles), vec!["C1", "DM1"]);
        assert_eq!(fixture.dictionary.snapshot().len(), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_manifest_swap_deactivates_until_revalidated() {
        let fixture = Fixture::new(5_000);
        let (manager, mut handles) = fixture.manager();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(manager.run(cancel.clone()));

        handles
            .events_tx
            .send(ControlEvent::Document(InboundDocument::DecoderManifest(
                manifest("DM1").to_json(),
            )))
            .await
            .unwrap();
        handles
            .events_tx
            .send(ControlEvent::Document(InboundDocument::CollectionSchemes(
                CampaignList {
                    campaigns: vec![
                        campaign("C1", "DM1", 0, 100_000),
                        campaign("C2", "DM1", 0, 100_000),
                    ],
                }
                .to_json(),
            )))
            .await
            .unwrap();

        loop {
            handles.matrix_rx.changed().await.unwrap();
            if handles.matrix_rx.borrow().campaigns.len() == 2 {
                break;
            }
        }

        // Swap to DM2: both campaigns leave the matrix within one cycle
        // and the checkin reports only DM2.
        handles
            .events_tx
            .send(ControlEvent::Document(InboundDocument::DecoderManifest(
                manifest("DM2").to_json(),
            )))
            .await
            .unwrap();

        loop {
            handles.matrix_rx.changed().await.unwrap();
            if handles.matrix_rx.borrow().is_empty() {
                break;
            }
        }
        assert_eq!(checkin_ids(&handles), vec!["DM2"]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_start_activates_at_deadline() {
        let fixture = Fixture::new(1_000);
        let (manager, mut handles) = fixture.manager();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(manager.run(cancel.clone()));

        handles
            .events_tx
            .send(ControlEvent::Document(InboundDocument::DecoderManifest(
                manifest("DM1").to_json(),
            )))
            .await
            .unwrap();
        handles
            .events_tx
            .send(ControlEvent::Document(InboundDocument::CollectionSchemes(
                CampaignList {
                    campaigns: vec![campaign("C1", "DM1", 2_000, 3_000)],
                }
                .to_json(),
            )))
            .await
            .unwrap();

        // Pending: reported but not active.
        loop {
            handles.checkin_rx.changed().await.unwrap();
            if checkin_ids(&handles) == vec!["C1", "DM1"] {
                break;
            }
        }
        assert!(handles.matrix_rx.borrow().is_empty());

        // Cross the start boundary; the manager wakes via its capped sleep.
        fixture.clock.advance_ms(1_100);
        loop {
            handles.matrix_rx.changed().await.unwrap();
            if !handles.matrix_rx.borrow().is_empty() {
                break;
            }
        }

        // Cross expiry: matrix empties and the campaign leaves the report.
        fixture.clock.advance_ms(1_000);
        loop {
            handles.matrix_rx.changed().await.unwrap();
            if handles.matrix_rx.borrow().is_empty() {
                break;
            }
        }
        assert_eq!(checkin_ids(&handles), vec!["DM1"]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_before_first_checkin() {
        let fixture = Fixture::new(5_000);

        // Seed persistence as a previous run would have left it.
        fixture
            .persistence
            .write(BlobKind::DecoderManifest, &manifest("DM1").to_json())
            .unwrap();
        fixture
            .persistence
            .write(
                BlobKind::CampaignList,
                &CampaignList {
                    campaigns: vec![
                        campaign("COLLECTIONSCHEME1", "DM1", 0, 100_000),
                        campaign("COLLECTIONSCHEME2", "DM1", 0, 100_000),
                    ],
                }
                .to_json(),
            )
            .unwrap();

        let (manager, mut handles) = fixture.manager();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(manager.run(cancel.clone()));

        // The very first snapshot already contains the restored documents.
        handles.checkin_rx.wait_for(Option::is_some).await.unwrap();
        assert_eq!(
            checkin_ids(&handles),
            vec!["COLLECTIONSCHEME1", "COLLECTIONSCHEME2", "DM1"]
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_document_keeps_previous_state() {
        let fixture = Fixture::new(5_000);
        let (manager, mut handles) = fixture.manager();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(manager.run(cancel.clone()));

        handles
            .events_tx
            .send(ControlEvent::Document(InboundDocument::DecoderManifest(
                manifest("DM1").to_json(),
            )))
            .await
            .unwrap();
        loop {
            handles.checkin_rx.changed().await.unwrap();
            if checkin_ids(&handles) == vec!["DM1"] {
                break;
            }
        }

        handles
            .events_tx
            .send(ControlEvent::Document(InboundDocument::DecoderManifest(
                b"{broken".to_vec(),
            )))
            .await
            .unwrap();
        // Give the manager a cycle; DM1 must survive.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(checkin_ids(&handles), vec!["DM1"]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_template_version_gate_reaches_checkin() {
        let fixture = Fixture::new(5_000);
        let (manager, mut handles) = fixture.manager();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(manager.run(cancel.clone()));

        let send = |diff: StateTemplatesDiff| {
            let tx = handles.events_tx.clone();
            async move {
                tx.send(ControlEvent::Document(InboundDocument::StateTemplates(
                    serde_json::to_vec(&diff).unwrap(),
                )))
                .await
                .unwrap();
            }
        };

        send(StateTemplatesDiff {
            version: 456,
            added: vec!["LKS1".to_string()],
            removed: vec![],
        })
        .await;
        loop {
            handles.checkin_rx.changed().await.unwrap();
            if checkin_ids(&handles) == vec!["LKS1"] {
                break;
            }
        }

        // Stale version: ignored.
        send(StateTemplatesDiff {
            version: 455,
            added: vec!["LKS2".to_string()],
            removed: vec![],
        })
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(checkin_ids(&handles), vec!["LKS1"]);

        // Same version: applied.
        send(StateTemplatesDiff {
            version: 456,
            added: vec!["LKS2".to_string()],
            removed: vec![],
        })
        .await;
        loop {
            handles.checkin_rx.changed().await.unwrap();
            if checkin_ids(&handles) == vec!["LKS1", "LKS2"] {
                break;
            }
        }

        send(StateTemplatesDiff {
            version: 456,
            added: vec![],
            removed: vec!["LKS1".to_string()],
        })
        .await;
        loop {
            handles.checkin_rx.changed().await.unwrap();
            if checkin_ids(&handles) == vec!["LKS2"] {
                break;
            }
        }

        cancel.cancel();
        task.await.unwrap();
    }
}
