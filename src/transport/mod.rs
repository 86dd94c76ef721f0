//! Cloud transport contract
//!
//! The broker protocol itself is out of scope; this is the narrow contract
//! the agent consumes. `HttpTransport` bridges to the cloud ingest over
//! HTTPS; `MockTransport` backs tests with channels and scriptable
//! failures.

mod http;
mod mock;
mod poller;

pub use http::HttpTransport;
pub use mock::MockTransport;
pub use poller::run_document_poller;

use async_trait::async_trait;
use thiserror::Error;

/// Transport failures. Checkins retry on the next interval; payloads may
/// be persisted depending on the campaign.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport request failed: {0}")]
    Request(String),

    #[error("server returned status {0}")]
    ServerError(u16),
}

/// Control-plane documents arriving from the cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundDocument {
    DecoderManifest(Vec<u8>),
    CollectionSchemes(Vec<u8>),
    StateTemplates(Vec<u8>),
}

/// Narrow publish/poll contract with the cloud.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Announce the document sync-ids currently active on the agent.
    async fn publish_checkin(&self, sync_ids: &[String]) -> Result<(), TransportError>;

    /// Deliver one triggered-data payload, already serialized (and
    /// compressed when `compressed` is set).
    async fn publish_vehicle_data(
        &self,
        payload: &[u8],
        compressed: bool,
    ) -> Result<(), TransportError>;

    /// Fetch any control-plane documents queued for this vehicle.
    async fn poll_documents(&self) -> Result<Vec<InboundDocument>, TransportError>;
}
