//! Checkin reporter
//!
//! Periodically announces the set of document sync-ids currently active on
//! the agent: the active decoder manifest, validated campaigns, and state
//! templates. The first checkin waits until the campaign manager has
//! restored persisted state, so restored documents are reported rather
//! than an empty set. A failed send retries on the next interval with the
//! snapshot current at that time, never the one that failed.

use crate::transport::Transport;
use crate::types::SyncId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The sync-ids one checkin announces. Assembled atomically by the
/// campaign manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckinSnapshot {
    pub sync_ids: Vec<SyncId>,
}

/// Run the checkin loop until cancelled.
///
/// `snapshot_rx` starts as `None` and flips to `Some` once persisted state
/// is restored; the first checkin is gated on that flip.
pub async fn run_checkin_reporter(
    transport: Arc<dyn Transport>,
    mut snapshot_rx: watch::Receiver<Option<CheckinSnapshot>>,
    interval_ms: u64,
    cancel: CancellationToken,
) {
    // Gate: no checkin, not even an empty one, before restoration.
    tokio::select! {
        _ = cancel.cancelled() => return,
        result = snapshot_rx.wait_for(Option::is_some) => {
            if result.is_err() {
                return; // manager gone before restoring
            }
        }
    }
    info!(interval_ms, "Checkin reporter started");

    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut consecutive_failures: u32 = 0;

    loop {
        // First tick fires immediately: the restored state is announced
        // without waiting a full interval.
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        // Always the snapshot current at send time.
        let sync_ids = match snapshot_rx.borrow().as_ref() {
            Some(snapshot) => snapshot.sync_ids.clone(),
            None => continue,
        };

        match transport.publish_checkin(&sync_ids).await {
            Ok(()) => {
                if consecutive_failures > 0 {
                    info!(
                        after_failures = consecutive_failures,
                        "Checkin delivered after retries"
                    );
                    consecutive_failures = 0;
                }
                debug!(count = sync_ids.len(), "Checkin sent");
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    error = %e,
                    consecutive_failures,
                    "Checkin failed, will retry next interval"
                );
            }
        }
    }
    info!("Checkin reporter stopped");
}
