//! Bounded sample queue feeding the distributor

use super::PipelineError;
use crate::types::SignalSample;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Shared drop accounting for the pipeline.
#[derive(Debug, Default)]
struct PipelineCounters {
    pushed: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of pipeline counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub pushed: u64,
    pub dropped: u64,
}

/// Entry point of the signal pipeline. Hands out producer handles and the
/// single receiver the distributor consumes.
pub struct SignalPipeline {
    tx: mpsc::Sender<SignalSample>,
    counters: Arc<PipelineCounters>,
}

impl SignalPipeline {
    /// Create a pipeline with the given bounded capacity.
    ///
    /// Returns the pipeline plus the receiving end for the distributor.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SignalSample>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                counters: Arc::new(PipelineCounters::default()),
            },
            rx,
        )
    }

    /// Create a producer handle for one bus/source thread.
    pub fn producer(&self, source_name: &str) -> SignalProducer {
        SignalProducer {
            tx: self.tx.clone(),
            counters: Arc::clone(&self.counters),
            dropped: Arc::new(AtomicU64::new(0)),
            source_name: source_name.to_string(),
        }
    }

    /// Aggregate counters across all producers.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            pushed: self.counters.pushed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Non-blocking producer handle held by a bus/source adapter.
#[derive(Clone)]
pub struct SignalProducer {
    tx: mpsc::Sender<SignalSample>,
    counters: Arc<PipelineCounters>,
    dropped: Arc<AtomicU64>,
    source_name: String,
}

impl SignalProducer {
    /// Push a sample without blocking.
    ///
    /// A full queue drops the sample and bumps the drop counters; the
    /// caller keeps producing. A closed queue is an error — the agent is
    /// shutting down.
    pub fn push(&self, sample: SignalSample) -> Result<(), PipelineError> {
        match self.tx.try_send(sample) {
            Ok(()) => {
                self.counters.pushed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                if total.is_power_of_two() {
                    debug!(
                        source = %self.source_name,
                        dropped = total,
                        "Signal pipeline full — dropping sample"
                    );
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PipelineError::Closed),
        }
    }

    /// Samples this producer has dropped on a full queue.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalValue;

    fn sample(id: u32, ts: u64) -> SignalSample {
        SignalSample::new(id, ts, SignalValue::F64(1.0))
    }

    #[tokio::test]
    async fn test_push_and_receive_in_order() {
        let (pipeline, mut rx) = SignalPipeline::new(8);
        let producer = pipeline.producer("can0");

        producer.push(sample(1, 10)).unwrap();
        producer.push(sample(1, 20)).unwrap();

        assert_eq!(rx.recv().await.unwrap().timestamp_ms, 10);
        assert_eq!(rx.recv().await.unwrap().timestamp_ms, 20);
        assert_eq!(pipeline.stats().pushed, 2);
        assert_eq!(pipeline.stats().dropped, 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_with_counter() {
        let (pipeline, _rx) = SignalPipeline::new(2);
        let producer = pipeline.producer("can0");

        producer.push(sample(1, 1)).unwrap();
        producer.push(sample(1, 2)).unwrap();
        producer.push(sample(1, 3)).unwrap(); // full — dropped

        assert_eq!(producer.dropped(), 1);
        assert_eq!(pipeline.stats().dropped, 1);
        assert_eq!(pipeline.stats().pushed, 2);
    }

    #[tokio::test]
    async fn test_closed_queue_errors() {
        let (pipeline, rx) = SignalPipeline::new(2);
        let producer = pipeline.producer("can0");
        drop(rx);
        drop(pipeline);

        assert!(producer.push(sample(1, 1)).is_err());
    }
}
