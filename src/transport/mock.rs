//! Channel-backed transport for tests

use super::{InboundDocument, Transport, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// One published vehicle-data payload as the mock saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPayload {
    pub payload: Vec<u8>,
    pub compressed: bool,
}

/// In-memory transport. Checkins and payloads are recorded; inbound
/// documents are queued by the test; the next N sends can be made to fail.
#[derive(Default)]
pub struct MockTransport {
    checkins: Mutex<Vec<Vec<String>>>,
    payloads: Mutex<Vec<PublishedPayload>>,
    inbound: Mutex<VecDeque<Vec<InboundDocument>>>,
    fail_next: AtomicU32,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publish operations fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Queue a batch of documents for the next poll.
    pub fn queue_documents(&self, documents: Vec<InboundDocument>) {
        if let Ok(mut inbound) = self.inbound.lock() {
            inbound.push_back(documents);
        }
    }

    /// All checkins published so far, oldest first.
    pub fn checkins(&self) -> Vec<Vec<String>> {
        self.checkins.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// All vehicle-data payloads published so far.
    pub fn published(&self) -> Vec<PublishedPayload> {
        self.payloads.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish_checkin(&self, sync_ids: &[String]) -> Result<(), TransportError> {
        if self.take_failure() {
            return Err(TransportError::Request("mock failure".to_string()));
        }
        if let Ok(mut checkins) = self.checkins.lock() {
            checkins.push(sync_ids.to_vec());
        }
        Ok(())
    }

    async fn publish_vehicle_data(
        &self,
        payload: &[u8],
        compressed: bool,
    ) -> Result<(), TransportError> {
        if self.take_failure() {
            return Err(TransportError::Request("mock failure".to_string()));
        }
        if let Ok(mut payloads) = self.payloads.lock() {
            payloads.push(PublishedPayload {
                payload: payload.to_vec(),
                compressed,
            });
        }
        Ok(())
    }

    async fn poll_documents(&self) -> Result<Vec<InboundDocument>, TransportError> {
        Ok(self
            .inbound
            .lock()
            .ok()
            .and_then(|mut inbound| inbound.pop_front())
            .unwrap_or_default())
    }
}
