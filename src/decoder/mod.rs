//! Decoder manifest and decoder dictionary
//!
//! The manifest is the cloud's mapping from external identifiers (CAN
//! frame, OBD PID, custom source name) to internal signal IDs and types.
//! Exactly one manifest is active at a time.
//!
//! The dictionary is the bus-adapter-facing projection of the active
//! manifest, filtered down to the signals that active campaigns actually
//! need. It is immutable after publication; the campaign manager publishes
//! a fresh snapshot whenever the required-signal set changes, and readers
//! hold a stable snapshot for the duration of a sample's processing.

mod dictionary;
mod manifest;

pub use dictionary::{DecoderDictionary, DictionaryPublisher};
pub use manifest::{DecoderManifest, ManifestError, SignalDecoderRule, SignalSource};
