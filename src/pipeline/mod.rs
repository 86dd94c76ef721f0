//! Signal pipeline
//!
//! Bounded multi-producer queue of decoded signal samples with a single
//! distributor that fans out to registered consumer queues. Producers are
//! non-blocking: a full queue drops the sample and increments the producer's
//! drop counter, never silently.
//!
//! Ordering guarantee: within one producer, samples reach a consumer in
//! arrival order. Across producers there is no ordering.

mod distributor;
mod queue;

pub use distributor::{ConsumerId, DistributorHandle, SignalDistributor};
pub use queue::{PipelineStats, SignalPipeline, SignalProducer};

use thiserror::Error;

/// Errors surfaced by pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline closed — distributor has shut down")]
    Closed,
}
