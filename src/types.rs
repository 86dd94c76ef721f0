//! Shared data structures for the collection & inspection core
//!
//! This module defines the types that cross module boundaries:
//! - SignalSample (decoded bus value flowing through the pipeline)
//! - SignalValue / SignalType (typed sample payloads)
//! - RawDataHandle (opaque reference into the raw data buffer arena)
//! - TriggeredData (assembled collection result handed to the uploader)

use serde::{Deserialize, Serialize};

// ============================================================================
// Signal identity
// ============================================================================

/// Internal signal identifier, minted by decoder manifest ingest.
///
/// Stable for the lifetime of one decoder manifest; a manifest swap may
/// remint the entire ID space.
pub type SignalId = u32;

/// Cloud-assigned opaque document version identifier.
pub type SyncId = String;

// ============================================================================
// Signal values
// ============================================================================

/// Physical type of a signal as declared by the decoder manifest.
///
/// The type of a given `SignalId` is immutable within one manifest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SignalType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Bool,
    String,
    Bytes,
}

impl SignalType {
    /// True for types whose payload is parked in the raw data buffer
    /// instead of travelling inline through the pipeline.
    pub fn is_complex(&self) -> bool {
        matches!(self, SignalType::String | SignalType::Bytes)
    }

    /// True for types that widen to f64 for comparison.
    pub fn is_numeric(&self) -> bool {
        !matches!(self, SignalType::Bool | SignalType::String | SignalType::Bytes)
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SignalType::Int8 => "i8",
            SignalType::Int16 => "i16",
            SignalType::Int32 => "i32",
            SignalType::Int64 => "i64",
            SignalType::Uint8 => "u8",
            SignalType::Uint16 => "u16",
            SignalType::Uint32 => "u32",
            SignalType::Uint64 => "u64",
            SignalType::Float32 => "f32",
            SignalType::Float64 => "f64",
            SignalType::Bool => "bool",
            SignalType::String => "string",
            SignalType::Bytes => "bytes",
        };
        write!(f, "{}", name)
    }
}

/// Opaque 32-bit handle into the raw data buffer arena.
///
/// Handles are only meaningful together with the owning `SignalId`;
/// frames are content-addressed within a signal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RawDataHandle(pub u32);

impl std::fmt::Display for RawDataHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:08x}", self.0)
    }
}

/// Decoded value of a single signal sample.
///
/// Numeric variants mirror the manifest-declared width so round-tripping to
/// the cloud preserves the original type. Comparison and arithmetic in the
/// inspection engine widen to f64.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SignalValue {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    /// Small inline string (fits in the pipeline without a raw buffer trip)
    String(String),
    /// Oversized payload parked in the raw data buffer
    RawHandle(RawDataHandle),
}

impl SignalValue {
    /// Widen to f64 for comparison. `None` for non-numeric values.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            SignalValue::I8(v) => Some(f64::from(v)),
            SignalValue::I16(v) => Some(f64::from(v)),
            SignalValue::I32(v) => Some(f64::from(v)),
            SignalValue::I64(v) => Some(v as f64),
            SignalValue::U8(v) => Some(f64::from(v)),
            SignalValue::U16(v) => Some(f64::from(v)),
            SignalValue::U32(v) => Some(f64::from(v)),
            SignalValue::U64(v) => Some(v as f64),
            SignalValue::F32(v) => Some(f64::from(v)),
            SignalValue::F64(v) => Some(v),
            SignalValue::Bool(v) => Some(if v { 1.0 } else { 0.0 }),
            SignalValue::String(_) | SignalValue::RawHandle(_) => None,
        }
    }

    /// The manifest type this value belongs to.
    pub fn signal_type(&self) -> SignalType {
        match self {
            SignalValue::I8(_) => SignalType::Int8,
            SignalValue::I16(_) => SignalType::Int16,
            SignalValue::I32(_) => SignalType::Int32,
            SignalValue::I64(_) => SignalType::Int64,
            SignalValue::U8(_) => SignalType::Uint8,
            SignalValue::U16(_) => SignalType::Uint16,
            SignalValue::U32(_) => SignalType::Uint32,
            SignalValue::U64(_) => SignalType::Uint64,
            SignalValue::F32(_) => SignalType::Float32,
            SignalValue::F64(_) => SignalType::Float64,
            SignalValue::Bool(_) => SignalType::Bool,
            SignalValue::String(_) => SignalType::String,
            SignalValue::RawHandle(_) => SignalType::Bytes,
        }
    }
}

// ============================================================================
// Samples
// ============================================================================

/// One decoded signal sample flowing from a bus adapter to the inspection
/// engine.
///
/// `timestamp_ms` is wall-clock epoch milliseconds, monotonic per source
/// but not across sources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalSample {
    pub signal_id: SignalId,
    pub timestamp_ms: u64,
    pub value: SignalValue,
}

impl SignalSample {
    pub fn new(signal_id: SignalId, timestamp_ms: u64, value: SignalValue) -> Self {
        Self {
            signal_id,
            timestamp_ms,
            value,
        }
    }
}

// ============================================================================
// Triggered data
// ============================================================================

/// One collected (signal, timestamp, value) entry inside a triggered bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectedSignal {
    pub signal_id: SignalId,
    pub timestamp_ms: u64,
    pub value: SignalValue,
}

/// Reference to a raw data frame that is part of a triggered bundle.
///
/// The handle stays borrowed (reference-counted) from assembly until the
/// uploader resolves it to bytes and releases it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDataRef {
    pub signal_id: SignalId,
    pub handle: RawDataHandle,
}

/// Assembled collection result for one campaign fire.
///
/// Size is bounded by the campaign's declared sample buffers times the
/// number of referenced signals. Consumed by the uploader or persisted.
#[derive(Debug, Clone)]
pub struct TriggeredData {
    pub campaign_sync_id: SyncId,
    pub trigger_ts: u64,
    pub signals: Vec<CollectedSignal>,
    pub raw_data_refs: Vec<RawDataRef>,
    /// Snapshot of active diagnostic trouble codes, when the campaign
    /// requested them.
    pub active_dtcs: Option<Vec<String>>,
    /// Copied from the campaign so the uploader needs no campaign lookup.
    pub compress: bool,
    /// Campaign asked for persistence when the transport is down.
    pub persist: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_value_widening() {
        assert_eq!(SignalValue::I8(-5).as_f64(), Some(-5.0));
        assert_eq!(SignalValue::U64(7).as_f64(), Some(7.0));
        assert_eq!(SignalValue::Bool(true).as_f64(), Some(1.0));
        assert_eq!(SignalValue::String("x".to_string()).as_f64(), None);
        assert_eq!(SignalValue::RawHandle(RawDataHandle(3)).as_f64(), None);
    }

    #[test]
    fn test_signal_type_classification() {
        assert!(SignalType::Bytes.is_complex());
        assert!(SignalType::String.is_complex());
        assert!(!SignalType::Float64.is_complex());
        assert!(SignalType::Uint32.is_numeric());
        assert!(!SignalType::Bool.is_numeric());
    }

    #[test]
    fn test_sample_serialization() {
        let sample = SignalSample::new(42, 1_700_000_000_000, SignalValue::F64(98.6));
        let json = serde_json::to_string(&sample);
        assert!(json.is_ok());
    }
}
