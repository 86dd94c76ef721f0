//! Raw data buffer manager
//!
//! Content-addressed arena for oversized opaque signal payloads (images,
//! strings, serialized frames). Quotas are fixed at startup from the agent
//! configuration: per-signal reserved bytes, max bytes, max samples, max
//! bytes per sample, plus a global cap shared by all signals beyond their
//! reservations.
//!
//! Admission: a new frame that would exceed `max_samples` evicts the oldest
//! unreferenced frame for that signal; if every frame is referenced, the new
//! frame is rejected. A frame larger than `max_bytes_per_sample` is rejected
//! outright. Signals without a quota entry cannot store at all (`NO_CONFIG`).
//!
//! All frame bytes are owned here; other components hold `RawDataHandle`
//! borrow handles with explicit release.

use crate::config::{RawDataBufferConfig, RawSignalBufferConfig};
use crate::types::{RawDataHandle, SignalId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

/// Admission and borrow errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RawBufferError {
    /// No quota entry exists for this signal; stores always fail.
    #[error("no raw buffer configuration for signal {0}")]
    NoConfig(SignalId),

    /// Single frame exceeds the per-sample cap.
    #[error("frame of {size} bytes exceeds per-sample cap of {max} bytes")]
    TooLarge { size: u64, max: u64 },

    /// Quota pressure and every evictable frame is still referenced.
    #[error("raw buffer exhausted for signal {0} — all frames referenced")]
    Exhausted(SignalId),
}

/// Read-only view of a borrowed frame.
///
/// Holding a view does not pin the arena slot by itself — the slot's
/// reference count does. Pair every successful `borrow` with exactly one
/// `release` on every exit path.
#[derive(Debug, Clone)]
pub struct FrameView {
    data: Arc<Vec<u8>>,
}

impl FrameView {
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

struct Frame {
    handle: RawDataHandle,
    data: Arc<Vec<u8>>,
    refs: u32,
}

struct SignalArena {
    config: RawSignalBufferConfig,
    /// Insertion order, oldest first.
    frames: Vec<Frame>,
    used_bytes: u64,
}

impl SignalArena {
    /// Bytes this signal draws from the shared pool (usage past its
    /// reservation).
    fn shared_draw(&self) -> u64 {
        self.used_bytes.saturating_sub(self.config.reserved_bytes)
    }

    /// Evict the oldest unreferenced frame. Returns freed bytes.
    fn evict_oldest_unreferenced(&mut self) -> Option<u64> {
        let idx = self.frames.iter().position(|f| f.refs == 0)?;
        let frame = self.frames.remove(idx);
        let freed = frame.data.len() as u64;
        self.used_bytes -= freed;
        debug!(
            signal_id = self.config.signal_id,
            handle = %frame.handle,
            freed_bytes = freed,
            "Evicted raw data frame"
        );
        Some(freed)
    }
}

/// Owner of all raw frame bytes. Multi-producer, multi-consumer; locking is
/// per signal with a separate shared-pool ledger.
pub struct RawDataBufferManager {
    arenas: HashMap<SignalId, Mutex<SignalArena>>,
    /// Global budget left for usage beyond per-signal reservations.
    shared_pool: u64,
    shared_used: Mutex<u64>,
}

impl RawDataBufferManager {
    /// Build the arena set from startup configuration. The signal set is
    /// fixed for the process lifetime.
    pub fn new(config: &RawDataBufferConfig) -> Self {
        let reserved_total: u64 = config.signals.iter().map(|s| s.reserved_bytes).sum();
        let arenas = config
            .signals
            .iter()
            .map(|entry| {
                (
                    entry.signal_id,
                    Mutex::new(SignalArena {
                        config: entry.clone(),
                        frames: Vec::new(),
                        used_bytes: 0,
                    }),
                )
            })
            .collect();

        Self {
            arenas,
            shared_pool: config.global_max_bytes.saturating_sub(reserved_total),
            shared_used: Mutex::new(0),
        }
    }

    /// Whether a quota entry exists for this signal.
    pub fn has_config(&self, signal_id: SignalId) -> bool {
        self.arenas.contains_key(&signal_id)
    }

    /// Store a frame, content-addressed within the signal.
    ///
    /// Storing bytes identical to an existing frame returns the existing
    /// handle without consuming additional quota.
    pub fn store(&self, signal_id: SignalId, bytes: &[u8]) -> Result<RawDataHandle, RawBufferError> {
        let arena = self
            .arenas
            .get(&signal_id)
            .ok_or(RawBufferError::NoConfig(signal_id))?;
        let mut arena = arena.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let size = bytes.len() as u64;
        if size > arena.config.max_bytes_per_sample {
            return Err(RawBufferError::TooLarge {
                size,
                max: arena.config.max_bytes_per_sample,
            });
        }

        // Content addressing: identical bytes share a slot.
        let handle = Self::address(&arena, bytes);
        if let Some(existing) = arena.frames.iter().find(|f| f.handle == handle) {
            if existing.data.as_slice() == bytes {
                return Ok(handle);
            }
        }

        // Frame-count quota.
        if arena.frames.len() as u32 >= arena.config.max_samples {
            self.evict_with_ledger(&mut arena)
                .ok_or(RawBufferError::Exhausted(signal_id))?;
        }

        // Per-signal byte quota.
        while arena.used_bytes + size > arena.config.max_bytes {
            self.evict_with_ledger(&mut arena)
                .ok_or(RawBufferError::Exhausted(signal_id))?;
        }

        // Shared-pool quota for usage past this signal's reservation.
        loop {
            let draw_before = arena.shared_draw();
            let draw_after = (arena.used_bytes + size).saturating_sub(arena.config.reserved_bytes);
            let delta = draw_after - draw_before;

            let mut shared = self
                .shared_used
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if *shared + delta <= self.shared_pool {
                *shared += delta;
                break;
            }
            drop(shared);

            if self.evict_with_ledger(&mut arena).is_none() {
                warn!(signal_id, size, "Raw buffer shared pool exhausted");
                return Err(RawBufferError::Exhausted(signal_id));
            }
        }

        arena.used_bytes += size;
        arena.frames.push(Frame {
            handle,
            data: Arc::new(bytes.to_vec()),
            refs: 0,
        });
        Ok(handle)
    }

    /// Borrow a stored frame, bumping its reference count.
    ///
    /// Returns `None` for unknown signals or handles (e.g. already evicted).
    pub fn borrow(&self, signal_id: SignalId, handle: RawDataHandle) -> Option<FrameView> {
        let arena = self.arenas.get(&signal_id)?;
        let mut arena = arena.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let frame = arena.frames.iter_mut().find(|f| f.handle == handle)?;
        frame.refs += 1;
        Some(FrameView {
            data: Arc::clone(&frame.data),
        })
    }

    /// Release one borrow of a frame. The frame becomes evictable once its
    /// reference count reaches zero.
    pub fn release(&self, signal_id: SignalId, handle: RawDataHandle) {
        let Some(arena) = self.arenas.get(&signal_id) else {
            return;
        };
        let mut arena = arena.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(frame) = arena.frames.iter_mut().find(|f| f.handle == handle) {
            if frame.refs == 0 {
                warn!(signal_id, handle = %handle, "Release without matching borrow");
            } else {
                frame.refs -= 1;
            }
        }
    }

    /// Current frame count for a signal (tests and stats).
    pub fn sample_count(&self, signal_id: SignalId) -> u32 {
        self.arenas
            .get(&signal_id)
            .map(|a| {
                a.lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .frames
                    .len() as u32
            })
            .unwrap_or(0)
    }

    /// Current byte usage for a signal (tests and stats).
    pub fn used_bytes(&self, signal_id: SignalId) -> u64 {
        self.arenas
            .get(&signal_id)
            .map(|a| {
                a.lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .used_bytes
            })
            .unwrap_or(0)
    }

    /// Evict from an arena and settle the shared ledger for freed overshoot.
    fn evict_with_ledger(&self, arena: &mut SignalArena) -> Option<u64> {
        let draw_before = arena.shared_draw();
        let freed = arena.evict_oldest_unreferenced()?;
        let draw_after = arena.shared_draw();
        let returned = draw_before - draw_after;
        if returned > 0 {
            let mut shared = self
                .shared_used
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *shared = shared.saturating_sub(returned);
        }
        Some(freed)
    }

    /// FNV-1a over the content, probed past handle collisions with
    /// different bytes.
    fn address(arena: &SignalArena, bytes: &[u8]) -> RawDataHandle {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in bytes {
            hash ^= u32::from(*byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        let mut handle = RawDataHandle(hash);
        while arena
            .frames
            .iter()
            .any(|f| f.handle == handle && f.data.as_slice() != bytes)
        {
            handle = RawDataHandle(handle.0.wrapping_add(1));
        }
        handle
    }
}
