//! Inspection engine
//!
//! Consumes decoded samples from the signal pipeline, maintains per-signal
//! ring buffers and fixed-window aggregators, evaluates campaign condition
//! trees, and emits triggered data bundles. Single consumer task; all hot
//! state is task-local and lock-free.

mod buffers;
mod engine;

pub use buffers::{FixedWindow, SignalBufferSet, WindowStats};
pub use engine::InspectionEngine;
