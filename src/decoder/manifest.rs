//! Decoder manifest document

use crate::types::{SignalId, SignalType, SyncId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Manifest ingest errors. A malformed document is discarded and the
/// previous manifest stays active.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest decode failed: {0}")]
    DecodeFailed(#[from] serde_json::Error),

    #[error("manifest {sync_id} declares signal {signal_id} more than once")]
    DuplicateSignal { sync_id: SyncId, signal_id: SignalId },
}

/// Where a signal is decoded from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum SignalSource {
    Can {
        interface: String,
        message_id: u32,
        start_bit: u16,
        bit_length: u16,
        factor: f64,
        offset: f64,
    },
    Obd {
        mode: u8,
        pid: u8,
    },
    Custom {
        name: String,
    },
}

/// One manifest entry: external source → internal signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalDecoderRule {
    pub signal_id: SignalId,
    pub signal_type: SignalType,
    #[serde(flatten)]
    pub source: SignalSource,
}

/// The active mapping from external identifiers to internal signal IDs.
///
/// Signal IDs and their types are stable within one manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecoderManifest {
    pub sync_id: SyncId,
    pub signals: Vec<SignalDecoderRule>,
}

impl DecoderManifest {
    /// Decode a manifest document from its wire form.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ManifestError> {
        let manifest: DecoderManifest = serde_json::from_slice(bytes)?;
        let mut seen = HashMap::new();
        for rule in &manifest.signals {
            if seen.insert(rule.signal_id, ()).is_some() {
                return Err(ManifestError::DuplicateSignal {
                    sync_id: manifest.sync_id.clone(),
                    signal_id: rule.signal_id,
                });
            }
        }
        Ok(manifest)
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Type of a signal in this manifest, if declared.
    pub fn signal_type(&self, signal_id: SignalId) -> Option<SignalType> {
        self.signals
            .iter()
            .find(|r| r.signal_id == signal_id)
            .map(|r| r.signal_type)
    }

    pub fn contains(&self, signal_id: SignalId) -> bool {
        self.signals.iter().any(|r| r.signal_id == signal_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn make_manifest(sync_id: &str) -> DecoderManifest {
        DecoderManifest {
            sync_id: sync_id.to_string(),
            signals: vec![
                SignalDecoderRule {
                    signal_id: 1,
                    signal_type: SignalType::Float64,
                    source: SignalSource::Can {
                        interface: "can0".to_string(),
                        message_id: 0x1A0,
                        start_bit: 0,
                        bit_length: 16,
                        factor: 0.1,
                        offset: -40.0,
                    },
                },
                SignalDecoderRule {
                    signal_id: 2,
                    signal_type: SignalType::Uint8,
                    source: SignalSource::Obd { mode: 1, pid: 0x0C },
                },
            ],
        }
    }

    #[test]
    fn test_roundtrip() {
        let manifest = make_manifest("DM1");
        let decoded = DecoderManifest::from_json(&manifest.to_json()).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn test_duplicate_signal_rejected() {
        let mut manifest = make_manifest("DM1");
        let dup = manifest.signals[0].clone();
        manifest.signals.push(dup);
        let err = DecoderManifest::from_json(&manifest.to_json()).unwrap_err();
        assert!(matches!(err, ManifestError::DuplicateSignal { .. }));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(DecoderManifest::from_json(b"{not json").is_err());
    }

    #[test]
    fn test_signal_type_lookup() {
        let manifest = make_manifest("DM1");
        assert_eq!(manifest.signal_type(1), Some(SignalType::Float64));
        assert_eq!(manifest.signal_type(9), None);
    }
}
