//! Decoder dictionary — published, immutable projection of the manifest

use super::manifest::{DecoderManifest, SignalSource};
use crate::types::{SignalId, SignalType, SyncId};
use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Read-only lookup from external identifiers to internal signals.
///
/// Carries per-protocol sub-maps. Built once by the campaign manager and
/// never mutated; swap the published pointer to change it.
#[derive(Debug, Default)]
pub struct DecoderDictionary {
    manifest_sync_id: SyncId,
    /// (interface, message id) → signals decoded from that frame.
    can: HashMap<(String, u32), Vec<SignalId>>,
    /// (mode, pid) → signal.
    obd: HashMap<(u8, u8), SignalId>,
    /// custom source name → signal.
    custom: HashMap<String, SignalId>,
    types: HashMap<SignalId, SignalType>,
}

impl DecoderDictionary {
    /// Project the manifest down to the signals campaigns require.
    ///
    /// Signals outside `required` are absent from every sub-map, so bus
    /// adapters skip decoding them entirely.
    pub fn build(manifest: &DecoderManifest, required: &HashSet<SignalId>) -> Self {
        let mut dict = DecoderDictionary {
            manifest_sync_id: manifest.sync_id.clone(),
            ..Default::default()
        };

        for rule in &manifest.signals {
            if !required.contains(&rule.signal_id) {
                continue;
            }
            dict.types.insert(rule.signal_id, rule.signal_type);
            match &rule.source {
                SignalSource::Can {
                    interface,
                    message_id,
                    ..
                } => {
                    dict.can
                        .entry((interface.clone(), *message_id))
                        .or_default()
                        .push(rule.signal_id);
                }
                SignalSource::Obd { mode, pid } => {
                    dict.obd.insert((*mode, *pid), rule.signal_id);
                }
                SignalSource::Custom { name } => {
                    dict.custom.insert(name.clone(), rule.signal_id);
                }
            }
        }

        debug!(
            manifest = %dict.manifest_sync_id,
            signals = dict.types.len(),
            can_frames = dict.can.len(),
            obd_pids = dict.obd.len(),
            custom = dict.custom.len(),
            "Decoder dictionary built"
        );
        dict
    }

    pub fn manifest_sync_id(&self) -> &str {
        &self.manifest_sync_id
    }

    /// Signals to decode from one CAN frame, if any.
    pub fn can_signals(&self, interface: &str, message_id: u32) -> Option<&[SignalId]> {
        self.can
            .get(&(interface.to_string(), message_id))
            .map(Vec::as_slice)
    }

    pub fn obd_signal(&self, mode: u8, pid: u8) -> Option<SignalId> {
        self.obd.get(&(mode, pid)).copied()
    }

    pub fn custom_signal(&self, name: &str) -> Option<SignalId> {
        self.custom.get(name).copied()
    }

    pub fn signal_type(&self, signal_id: SignalId) -> Option<SignalType> {
        self.types.get(&signal_id).copied()
    }

    /// Number of signals the dictionary decodes.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Atomic publication point for dictionary snapshots.
///
/// Readers load a snapshot and keep it for the duration of one sample's
/// processing; a concurrent publish never tears their view.
pub struct DictionaryPublisher {
    current: ArcSwap<DecoderDictionary>,
}

impl DictionaryPublisher {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(DecoderDictionary::default()),
        }
    }

    /// Swap in a freshly built dictionary.
    pub fn publish(&self, dictionary: DecoderDictionary) {
        self.current.store(Arc::new(dictionary));
    }

    /// Stable read-only snapshot of the current dictionary.
    pub fn snapshot(&self) -> Arc<DecoderDictionary> {
        self.current.load_full()
    }
}

impl Default for DictionaryPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::manifest::SignalDecoderRule;

    fn manifest() -> DecoderManifest {
        DecoderManifest {
            sync_id: "DM1".to_string(),
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
                        offset: 0.0,
                    },
                },
                SignalDecoderRule {
                    signal_id: 2,
                    signal_type: SignalType::Uint8,
                    source: SignalSource::Obd { mode: 1, pid: 0x0C },
                },
                SignalDecoderRule {
                    signal_id: 3,
                    signal_type: SignalType::Bytes,
                    source: SignalSource::Custom {
                        name: "camera.front".to_string(),
                    },
                },
            ],
        }
    }

    #[test]
    fn test_build_filters_to_required() {
        let required: HashSet<SignalId> = [1, 3].into_iter().collect();
        let dict = DecoderDictionary::build(&manifest(), &required);

        assert_eq!(dict.len(), 2);
        assert_eq!(dict.can_signals("can0", 0x1A0), Some(&[1][..]));
        assert_eq!(dict.obd_signal(1, 0x0C), None); // signal 2 not required
        assert_eq!(dict.custom_signal("camera.front"), Some(3));
        assert_eq!(dict.signal_type(3), Some(SignalType::Bytes));
    }

    #[test]
    fn test_empty_required_empties_dictionary() {
        let dict = DecoderDictionary::build(&manifest(), &HashSet::new());
        assert!(dict.is_empty());
        assert_eq!(dict.can_signals("can0", 0x1A0), None);
    }

    #[test]
    fn test_publisher_swaps_atomically() {
        let publisher = DictionaryPublisher::new();
        assert!(publisher.snapshot().is_empty());

        let required: HashSet<SignalId> = [1, 2, 3].into_iter().collect();
        let old = publisher.snapshot();
        publisher.publish(DecoderDictionary::build(&manifest(), &required));

        // A reader's old snapshot is unaffected by the publish.
        assert!(old.is_empty());
        assert_eq!(publisher.snapshot().len(), 3);
        assert_eq!(publisher.snapshot().manifest_sync_id(), "DM1");
    }
}
