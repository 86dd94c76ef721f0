//! Distributor — single consumer of the pipeline queue, fan-out to
//! registered consumer queues
//!
//! Registration is dynamic: a consumer queue may be attached or detached at
//! any time. Samples enqueued between detach-begin and detach-end may be
//! dropped; that window is the caller's to tolerate.

use crate::types::SignalSample;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Identifies one attached consumer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(u32);

struct ConsumerSlot {
    tx: mpsc::Sender<SignalSample>,
    dropped: u64,
}

#[derive(Default)]
struct Registry {
    consumers: HashMap<ConsumerId, ConsumerSlot>,
}

/// Attach/detach handle, cloneable across tasks.
#[derive(Clone)]
pub struct DistributorHandle {
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU32>,
    forwarded: Arc<AtomicU64>,
}

impl DistributorHandle {
    /// Attach a new consumer queue with the given capacity.
    pub fn attach(&self, capacity: usize) -> (ConsumerId, mpsc::Receiver<SignalSample>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = ConsumerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut registry) = self.registry.lock() {
            registry.consumers.insert(id, ConsumerSlot { tx, dropped: 0 });
        }
        debug!(consumer = id.0, capacity, "Pipeline consumer attached");
        (id, rx)
    }

    /// Detach a consumer. Samples in flight for it are dropped.
    pub fn detach(&self, id: ConsumerId) {
        if let Ok(mut registry) = self.registry.lock() {
            if registry.consumers.remove(&id).is_some() {
                debug!(consumer = id.0, "Pipeline consumer detached");
            }
        }
    }

    /// Samples forwarded to at least one consumer.
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }
}

/// Single-consumer fan-out loop over the pipeline queue.
pub struct SignalDistributor {
    rx: mpsc::Receiver<SignalSample>,
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU32>,
    forwarded: Arc<AtomicU64>,
}

impl SignalDistributor {
    pub fn new(rx: mpsc::Receiver<SignalSample>) -> Self {
        Self {
            rx,
            registry: Arc::new(Mutex::new(Registry::default())),
            next_id: Arc::new(AtomicU32::new(0)),
            forwarded: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn handle(&self) -> DistributorHandle {
        DistributorHandle {
            registry: Arc::clone(&self.registry),
            next_id: Arc::clone(&self.next_id),
            forwarded: Arc::clone(&self.forwarded),
        }
    }

    /// Run until cancelled. Consumes the distributor.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Signal distributor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                sample = self.rx.recv() => {
                    match sample {
                        Some(sample) => self.dispatch(sample),
                        None => break, // all producers dropped
                    }
                }
            }
        }
        info!("Signal distributor stopped");
    }

    /// Forward one sample to every attached consumer.
    ///
    /// Consumer queues are bounded too: a full consumer drops the sample
    /// for that consumer only, counted per slot.
    fn dispatch(&self, sample: SignalSample) {
        let Ok(mut registry) = self.registry.lock() else {
            return;
        };
        if registry.consumers.is_empty() {
            return;
        }

        let mut any = false;
        for slot in registry.consumers.values_mut() {
            match slot.tx.try_send(sample.clone()) {
                Ok(()) => any = true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    slot.dropped += 1;
                    if slot.dropped.is_power_of_two() {
                        debug!(dropped = slot.dropped, "Consumer queue full — dropping sample");
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // receiver gone without detach; reaped next attach/detach
                }
            }
        }
        if any {
            self.forwarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SignalPipeline;
    use crate::types::SignalValue;

    fn sample(id: u32, ts: u64) -> SignalSample {
        SignalSample::new(id, ts, SignalValue::U32(ts as u32))
    }

    #[tokio::test]
    async fn test_fanout_to_two_consumers() {
        let (pipeline, rx) = SignalPipeline::new(16);
        let distributor = SignalDistributor::new(rx);
        let handle = distributor.handle();
        let cancel = CancellationToken::new();

        let (_id_a, mut rx_a) = handle.attach(8);
        let (_id_b, mut rx_b) = handle.attach(8);

        let task = tokio::spawn(distributor.run(cancel.clone()));

        let producer = pipeline.producer("can0");
        producer.push(sample(1, 100)).unwrap();

        assert_eq!(rx_a.recv().await.unwrap().timestamp_ms, 100);
        assert_eq!(rx_b.recv().await.unwrap().timestamp_ms, 100);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_detach_stops_delivery() {
        let (pipeline, rx) = SignalPipeline::new(16);
        let distributor = SignalDistributor::new(rx);
        let handle = distributor.handle();
        let cancel = CancellationToken::new();

        let (id_a, mut rx_a) = handle.attach(8);
        let task = tokio::spawn(distributor.run(cancel.clone()));

        let producer = pipeline.producer("can0");
        producer.push(sample(1, 1)).unwrap();
        assert!(rx_a.recv().await.is_some());

        handle.detach(id_a);
        producer.push(sample(1, 2)).unwrap();

        // The consumer's queue sees no more samples once detached.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(rx_a.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_per_producer_order_preserved() {
        let (pipeline, rx) = SignalPipeline::new(64);
        let distributor = SignalDistributor::new(rx);
        let handle = distributor.handle();
        let cancel = CancellationToken::new();

        let (_id, mut consumer_rx) = handle.attach(64);
        let task = tokio::spawn(distributor.run(cancel.clone()));

        let producer = pipeline.producer("obd");
        for ts in 0..10u64 {
            producer.push(sample(2, ts)).unwrap();
        }

        for expected_ts in 0..10u64 {
            assert_eq!(consumer_rx.recv().await.unwrap().timestamp_ms, expected_ts);
        }

        cancel.cancel();
        task.await.unwrap();
    }
}
