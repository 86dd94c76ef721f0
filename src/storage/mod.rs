//! Persistence adapter — blob-per-kind store with a byte quota
//!
//! Keeps the last-received campaign list and decoder manifest (plus state
//! templates and undelivered payloads) across restarts. The directory holds
//! at most one blob per document kind:
//!
//! ```text
//! decoder_manifest.bin
//! collection_schemes.bin
//! state_templates.bin
//! payload-<ts>-<seq>.bin   (zero or more)
//! ```
//!
//! All writes are checked against a single byte budget; a write that would
//! exceed it fails with `DiskFull` and the caller decides whether to evict
//! older payloads. Reads are best-effort: a missing or unreadable blob is
//! `None`, and content corruption surfaces at the caller's decode step.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

/// Document kinds with a single blob slot each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    DecoderManifest,
    CampaignList,
    StateTemplates,
}

impl BlobKind {
    fn file_name(self) -> &'static str {
        match self {
            BlobKind::DecoderManifest => "decoder_manifest.bin",
            BlobKind::CampaignList => "collection_schemes.bin",
            BlobKind::StateTemplates => "state_templates.bin",
        }
    }
}

/// Persistence errors. Never fatal to the caller.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("persistence quota exceeded: need {needed} bytes, {available} available")]
    DiskFull { needed: u64, available: u64 },

    #[error("persistence IO error: {0}")]
    Io(String),
}

/// File-backed store rooted at the configured persistency path.
pub struct PersistenceAdapter {
    dir: PathBuf,
    max_bytes: u64,
    payload_seq: AtomicU64,
}

impl PersistenceAdapter {
    /// Open (creating the directory if needed).
    pub fn open<P: AsRef<Path>>(dir: P, max_bytes: u64) -> Result<Self, PersistenceError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| PersistenceError::Io(e.to_string()))?;

        // Resume the payload sequence past any files left from a previous
        // run so names never collide.
        let next_seq = fs::read_dir(&dir)
            .ok()
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name();
                let name = name.to_str()?;
                let rest = name.strip_prefix("payload-")?.strip_suffix(".bin")?;
                rest.rsplit('-').next()?.parse::<u64>().ok()
            })
            .max()
            .map_or(0, |max| max + 1);

        Ok(Self {
            dir,
            max_bytes,
            payload_seq: AtomicU64::new(next_seq),
        })
    }

    /// Store a document blob, replacing any previous blob of that kind.
    pub fn write(&self, kind: BlobKind, blob: &[u8]) -> Result<(), PersistenceError> {
        let path = self.dir.join(kind.file_name());
        let replaced = path.metadata().map(|m| m.len()).unwrap_or(0);
        self.check_quota(blob.len() as u64, replaced)?;

        fs::write(&path, blob).map_err(|e| PersistenceError::Io(e.to_string()))?;
        debug!(kind = ?kind, bytes = blob.len(), "Document persisted");
        Ok(())
    }

    /// Read a document blob. Best-effort: missing or unreadable is `None`.
    pub fn read(&self, kind: BlobKind) -> Option<Vec<u8>> {
        let path = self.dir.join(kind.file_name());
        match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(kind = ?kind, error = %e, "Persisted document unreadable — ignoring");
                None
            }
        }
    }

    /// Remove a document blob if present.
    pub fn erase(&self, kind: BlobKind) {
        let path = self.dir.join(kind.file_name());
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!(kind = ?kind, error = %e, "Failed to erase persisted document");
            }
        }
    }

    /// Store an undelivered payload under `payload-<ts>-<seq>.bin`.
    pub fn store_payload(&self, trigger_ts: u64, blob: &[u8]) -> Result<PathBuf, PersistenceError> {
        self.check_quota(blob.len() as u64, 0)?;

        let seq = self.payload_seq.fetch_add(1, Ordering::Relaxed);
        // Zero-padded so lexicographic directory order is delivery order.
        let path = self
            .dir
            .join(format!("payload-{:015}-{:06}.bin", trigger_ts, seq));
        fs::write(&path, blob).map_err(|e| PersistenceError::Io(e.to_string()))?;
        debug!(path = %path.display(), bytes = blob.len(), "Payload persisted");
        Ok(path)
    }

    /// Persisted payloads, oldest first (by file name: ts then seq).
    pub fn list_payloads(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut payloads: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("payload-") && n.ends_with(".bin"))
                    .unwrap_or(false)
            })
            .collect();
        payloads.sort();
        payloads
    }

    /// Read one persisted payload. Unreadable entries are dropped so a
    /// corrupt file cannot wedge the drain loop.
    pub fn read_payload(&self, path: &Path) -> Option<Vec<u8>> {
        match fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Persisted payload unreadable — removing");
                let _ = fs::remove_file(path);
                None
            }
        }
    }

    /// Delete a payload after successful delivery.
    pub fn delete_payload(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to delete delivered payload");
        }
    }

    /// Bytes currently used across all blobs.
    pub fn used_bytes(&self) -> u64 {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }

    fn check_quota(&self, incoming: u64, replaced: u64) -> Result<(), PersistenceError> {
        let used = self.used_bytes().saturating_sub(replaced);
        let available = self.max_bytes.saturating_sub(used);
        if incoming > available {
            return Err(PersistenceError::DiskFull {
                needed: incoming,
                available,
            });
        }
        Ok(())
    }
}
