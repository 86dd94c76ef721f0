//! Document poller — forwards control-plane documents to the campaign
//! manager

use super::Transport;
use crate::campaign::ControlEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Poll the transport for inbound documents and forward them as control
/// events. Runs until cancelled.
pub async fn run_document_poller(
    transport: Arc<dyn Transport>,
    events_tx: mpsc::Sender<ControlEvent>,
    interval_ms: u64,
    cancel: CancellationToken,
) {
    info!(interval_ms, "Document poller started");
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let documents = match transport.poll_documents().await {
            Ok(documents) => documents,
            Err(e) => {
                warn!(error = %e, "Document poll failed, will retry next cycle");
                continue;
            }
        };

        for document in documents {
            if events_tx.send(ControlEvent::Document(document)).await.is_err() {
                info!("Campaign manager gone — document poller stopping");
                return;
            }
        }
    }
    info!("Document poller stopped");
}
