//! Campaign lifecycle integration tests
//!
//! Exercises the campaign manager together with the checkin reporter and
//! the persistence adapter over a mock transport, driving state changes
//! with a manually advanced clock.

use fleetlink_edge::campaign::{
    Campaign, CampaignList, CampaignManager, CampaignManagerHandles, SignalRequirement,
    TriggerKind,
};
use fleetlink_edge::checkin::run_checkin_reporter;
use fleetlink_edge::clock::ManualClock;
use fleetlink_edge::Clock;
use fleetlink_edge::decoder::{
    DecoderManifest, DictionaryPublisher, SignalDecoderRule, SignalSource,
};
use fleetlink_edge::storage::{BlobKind, PersistenceAdapter};
use fleetlink_edge::transport::{InboundDocument, MockTransport};
use fleetlink_edge::types::SignalType;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn manifest(sync_id: &str) -> DecoderManifest {
    DecoderManifest {
        sync_id: sync_id.to_string(),
        signals: vec![SignalDecoderRule {
            signal_id: 1,
            signal_type: SignalType::Float64,
            source: SignalSource::Custom {
                name: "speed".to_string(),
            },
        }],
    }
}

fn campaign(sync_id: &str, manifest_id: &str) -> Campaign {
    Campaign {
        sync_id: sync_id.to_string(),
        decoder_manifest_sync_id: manifest_id.to_string(),
        start_ms: 0,
        expiry_ms: u64::MAX,
        trigger: TriggerKind::TimeBased { period_ms: 60_000 },
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
    transport: Arc<MockTransport>,
    cancel: CancellationToken,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        Self {
            persistence: Arc::new(
                PersistenceAdapter::open(tmp.path().join("persist"), 64 * 1024).unwrap(),
            ),
            _tmp: tmp,
            clock: ManualClock::new(1_000_000),
            transport: Arc::new(MockTransport::new()),
            cancel: CancellationToken::new(),
        }
    }

    fn spawn_manager(&self) -> (CampaignManagerHandles, tokio::task::JoinHandle<()>) {
        let (manager, handles) = CampaignManager::new(
            self.clock.clone(),
            self.persistence.clone(),
            Arc::new(DictionaryPublisher::new()),
            50,
        );
        let task = tokio::spawn(manager.run(self.cancel.clone()));
        (handles, task)
    }
}

async fn send(handles: &CampaignManagerHandles, document: InboundDocument) {
    handles
        .events_tx
        .send(fleetlink_edge::campaign::ControlEvent::Document(document))
        .await
        .unwrap();
}

fn sorted(mut ids: Vec<String>) -> Vec<String> {
    ids.sort();
    ids
}

/// Manifest swap: active campaigns deactivate within one manager cycle and
/// checkins report only the new manifest until campaigns re-validate.
#[tokio::test(start_paused = true)]
async fn test_manifest_swap_clears_active_set() {
    let fixture = Fixture::new();
    let (mut handles, manager_task) = fixture.spawn_manager();

    send(&handles, InboundDocument::DecoderManifest(manifest("DM1").to_json())).await;
    send(
        &handles,
        InboundDocument::CollectionSchemes(
            CampaignList {
                campaigns: vec![campaign("C1", "DM1"), campaign("C2", "DM1")],
            }
            .to_json(),
        ),
    )
    .await;

    loop {
        handles.matrix_rx.changed().await.unwrap();
        if handles.matrix_rx.borrow().campaigns.len() == 2 {
            break;
        }
    }

    send(&handles, InboundDocument::DecoderManifest(manifest("DM2").to_json())).await;
    loop {
        handles.matrix_rx.changed().await.unwrap();
        if handles.matrix_rx.borrow().is_empty() {
            break;
        }
    }

    let snapshot = handles.checkin_rx.borrow().clone().unwrap();
    assert_eq!(snapshot.sync_ids, vec!["DM2"]);

    fixture.cancel.cancel();
    manager_task.await.unwrap();
}

/// Persisted first checkin: after a restart the very first checkin carries
/// the restored documents, and no empty checkin precedes it.
#[tokio::test(start_paused = true)]
async fn test_persisted_state_reported_in_first_checkin() {
    let fixture = Fixture::new();

    // Previous run's persisted state.
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
                    campaign("COLLECTIONSCHEME1", "DM1"),
                    campaign("COLLECTIONSCHEME2", "DM1"),
                ],
            }
            .to_json(),
        )
        .unwrap();

    let (handles, manager_task) = fixture.spawn_manager();
    let reporter_task = tokio::spawn(run_checkin_reporter(
        fixture.transport.clone(),
        handles.checkin_rx.clone(),
        1_000,
        fixture.cancel.clone(),
    ));

    // Let the reporter run several would-be intervals.
    tokio::time::sleep(Duration::from_millis(3_500)).await;

    let checkins = fixture.transport.checkins();
    assert!(!checkins.is_empty(), "reporter should have checked in");
    for checkin in &checkins {
        assert_eq!(
            sorted(checkin.clone()),
            vec!["COLLECTIONSCHEME1", "COLLECTIONSCHEME2", "DM1"]
        );
    }

    fixture.cancel.cancel();
    manager_task.await.unwrap();
    reporter_task.await.unwrap();
}

/// Checkin retry: failures retry each interval and a later success carries
/// the snapshot current at that moment, not the one that failed.
#[tokio::test(start_paused = true)]
async fn test_checkin_retry_carries_current_snapshot() {
    let fixture = Fixture::new();
    let (handles, manager_task) = fixture.spawn_manager();

    // First three sends fail.
    fixture.transport.fail_next(3);
    let reporter_task = tokio::spawn(run_checkin_reporter(
        fixture.transport.clone(),
        handles.checkin_rx.clone(),
        1_000,
        fixture.cancel.clone(),
    ));

    // While the transport is down, DM1 arrives.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    send(&handles, InboundDocument::DecoderManifest(manifest("DM1").to_json())).await;

    tokio::time::sleep(Duration::from_millis(3_000)).await;

    let checkins = fixture.transport.checkins();
    assert!(!checkins.is_empty());
    // The first delivered checkin already names DM1.
    assert_eq!(checkins[0], vec!["DM1"]);

    fixture.cancel.cancel();
    manager_task.await.unwrap();
    reporter_task.await.unwrap();
}

/// Expiry driven by the wall clock: the campaign leaves the matrix when
/// its window closes, even with no inbound traffic.
#[tokio::test(start_paused = true)]
async fn test_expiry_without_traffic() {
    let fixture = Fixture::new();
    let (mut handles, manager_task) = fixture.spawn_manager();

    send(&handles, InboundDocument::DecoderManifest(manifest("DM1").to_json())).await;
    let mut expiring = campaign("C1", "DM1");
    expiring.expiry_ms = fixture.clock.now_ms() + 5_000;
    send(
        &handles,
        InboundDocument::CollectionSchemes(CampaignList { campaigns: vec![expiring] }.to_json()),
    )
    .await;

    loop {
        handles.matrix_rx.changed().await.unwrap();
        if !handles.matrix_rx.borrow().is_empty() {
            break;
        }
    }

    fixture.clock.advance_ms(6_000);
    loop {
        handles.matrix_rx.changed().await.unwrap();
        if handles.matrix_rx.borrow().is_empty() {
            break;
        }
    }
    // Expired campaigns stay out of the checkin report.
    let snapshot = handles.checkin_rx.borrow().clone().unwrap();
    assert_eq!(snapshot.sync_ids, vec!["DM1"]);

    fixture.cancel.cancel();
    manager_task.await.unwrap();
}
