//! Uploader — drains triggered data to the cloud
//!
//! Receives assembled bundles from the inspection engine, resolves raw
//! data handles to bytes, serializes, optionally compresses, and publishes
//! via the transport. On transport failure a bundle is persisted when its
//! campaign asked for that, and persisted payloads are re-drained
//! oldest-first once the transport recovers. Every borrowed raw data
//! handle is released on every exit path.

use crate::rawdata::RawDataBufferManager;
use crate::storage::{PersistenceAdapter, PersistenceError};
use crate::transport::Transport;
use crate::types::{SignalValue, TriggeredData};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Wire form of one resolved raw data frame.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct RawFramePayload {
    signal_id: u32,
    bytes: Vec<u8>,
}

/// Wire form of a triggered bundle, with raw handles resolved to bytes.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct VehicleDataPayload {
    campaign_sync_id: String,
    trigger_ts: u64,
    signals: Vec<crate::types::CollectedSignal>,
    raw_frames: Vec<RawFramePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    active_dtcs: Option<Vec<String>>,
}

/// Persisted payload envelope: the serialized bundle plus its compression
/// flag, so a restart can re-send it unchanged.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedPayload {
    compressed: bool,
    body: Vec<u8>,
}

pub struct Uploader {
    transport: Arc<dyn Transport>,
    rawdata: Arc<RawDataBufferManager>,
    persistence: Arc<PersistenceAdapter>,
    data_rx: mpsc::Receiver<TriggeredData>,
    drain_interval_ms: u64,

    uploaded: u64,
    persisted: u64,
    dropped: u64,
}

impl Uploader {
    pub fn new(
        transport: Arc<dyn Transport>,
        rawdata: Arc<RawDataBufferManager>,
        persistence: Arc<PersistenceAdapter>,
        data_rx: mpsc::Receiver<TriggeredData>,
        drain_interval_ms: u64,
    ) -> Self {
        Self {
            transport,
            rawdata,
            persistence,
            data_rx,
            drain_interval_ms,
            uploaded: 0,
            persisted: 0,
            dropped: 0,
        }
    }

    /// Run until cancelled. Live bundles are sent as they arrive; the
    /// persisted backlog drains on a timer.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Uploader started");
        let mut interval = tokio::time::interval(Duration::from_millis(self.drain_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                data = self.data_rx.recv() => {
                    match data {
                        Some(data) => self.handle_triggered(data).await,
                        None => break, // engine gone
                    }
                }
                _ = interval.tick() => {
                    self.drain_persisted().await;
                }
            }
        }
        info!(
            uploaded = self.uploaded,
            persisted = self.persisted,
            dropped = self.dropped,
            "Uploader stopped"
        );
    }

    /// Serialize, publish, and on failure persist or drop. Raw data
    /// borrows taken by the engine are released here, on every path.
    async fn handle_triggered(&mut self, data: TriggeredData) {
        let payload = self.resolve(&data);
        // All frame bytes are copied out; the arena slots can go.
        for r in &data.raw_data_refs {
            self.rawdata.release(r.signal_id, r.handle);
        }

        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                self.dropped += 1;
                warn!(campaign = %data.campaign_sync_id, error = %e, "Payload serialization failed");
                return;
            }
        };
        let (body, compressed) = if data.compress {
            match zstd::encode_all(body.as_slice(), 3) {
                Ok(compressed_body) => (compressed_body, true),
                Err(e) => {
                    warn!(campaign = %data.campaign_sync_id, error = %e, "Compression failed — sending uncompressed");
                    (body, false)
                }
            }
        } else {
            (body, false)
        };

        match self.transport.publish_vehicle_data(&body, compressed).await {
            Ok(()) => {
                self.uploaded += 1;
                debug!(
                    campaign = %data.campaign_sync_id,
                    bytes = body.len(),
                    compressed,
                    "Triggered data uploaded"
                );
                // A delivery success is the moment to retry the backlog.
                self.drain_persisted().await;
            }
            Err(e) if data.persist => {
                self.persist(&data, body, compressed);
                warn!(campaign = %data.campaign_sync_id, error = %e, "Upload failed — payload persisted");
            }
            Err(e) => {
                self.dropped += 1;
                warn!(
                    campaign = %data.campaign_sync_id,
                    error = %e,
                    dropped_total = self.dropped,
                    "Upload failed — payload dropped"
                );
            }
        }
    }

    /// Resolve raw handles into the wire payload.
    fn resolve(&self, data: &TriggeredData) -> VehicleDataPayload {
        let mut raw_frames = Vec::with_capacity(data.raw_data_refs.len());
        for r in &data.raw_data_refs {
            // The engine's borrow keeps the frame alive; this second
            // borrow is released as soon as the bytes are copied.
            if let Some(view) = self.rawdata.borrow(r.signal_id, r.handle) {
                raw_frames.push(RawFramePayload {
                    signal_id: r.signal_id,
                    bytes: view.bytes().to_vec(),
                });
                self.rawdata.release(r.signal_id, r.handle);
            }
        }

        VehicleDataPayload {
            campaign_sync_id: data.campaign_sync_id.clone(),
            trigger_ts: data.trigger_ts,
            // Handles are meaningless off-vehicle; strip them from the
            // inline signal list (the bytes travel in raw_frames).
            signals: data
                .signals
                .iter()
                .filter(|s| !matches!(s.value, SignalValue::RawHandle(_)))
                .cloned()
                .collect(),
            raw_frames,
            active_dtcs: data.active_dtcs.clone(),
        }
    }

    fn persist(&mut self, data: &TriggeredData, body: Vec<u8>, compressed: bool) {
        let envelope = PersistedPayload { compressed, body };
        let blob = match serde_json::to_vec(&envelope) {
            Ok(blob) => blob,
            Err(e) => {
                self.dropped += 1;
                warn!(error = %e, "Payload envelope serialization failed");
                return;
            }
        };

        loop {
            match self.persistence.store_payload(data.trigger_ts, &blob) {
                Ok(_) => {
                    self.persisted += 1;
                    return;
                }
                Err(PersistenceError::DiskFull { .. }) => {
                    // Newer data outranks older undelivered data.
                    let payloads = self.persistence.list_payloads();
                    match payloads.first() {
                        Some(oldest) => {
                            warn!(evicting = %oldest.display(), "Payload quota hit — evicting oldest");
                            self.persistence.delete_payload(oldest);
                        }
                        None => {
                            self.dropped += 1;
                            warn!("Payload larger than persistence quota — dropped");
                            return;
                        }
                    }
                }
                Err(e) => {
                    self.dropped += 1;
                    warn!(error = %e, "Payload persistence failed — dropped");
                    return;
                }
            }
        }
    }

    /// Send persisted payloads oldest-first, stopping at the first
    /// failure. Each file is deleted only after its publish succeeds.
    async fn drain_persisted(&mut self) {
        for path in self.persistence.list_payloads() {
            let Some(blob) = self.persistence.read_payload(&path) else {
                continue; // corrupt entry already removed
            };
            let envelope: PersistedPayload = match serde_json::from_slice(&blob) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Persisted payload corrupt — removing");
                    self.persistence.delete_payload(&path);
                    continue;
                }
            };

            match self
                .transport
                .publish_vehicle_data(&envelope.body, envelope.compressed)
                .await
            {
                Ok(()) => {
                    self.uploaded += 1;
                    self.persistence.delete_payload(&path);
                    debug!(path = %path.display(), "Persisted payload delivered");
                }
                Err(e) => {
                    debug!(error = %e, "Transport still down — backlog drain deferred");
                    return;
                }
            }
        }
    }
}
