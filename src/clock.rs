//! Clock abstraction injected into every time-driven component
//!
//! Campaign start/expiry comparisons use wall-clock epoch milliseconds as
//! supplied by the cloud; timeout arithmetic uses a monotonic reading.
//! Components never call the system clock directly, so tests can drive
//! lifecycle transitions deterministically with `ManualClock`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Time source for campaign lifecycle and rate-limit decisions.
pub trait Clock: Send + Sync {
    /// Wall-clock epoch milliseconds. Subject to jumps (NTP, cloud resync).
    fn now_ms(&self) -> u64;

    /// Monotonic milliseconds since an arbitrary origin. Never jumps.
    fn monotonic_ms(&self) -> u64;
}

/// Production clock backed by the OS.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis();
        // Pre-epoch wall clocks clamp to zero rather than wrapping.
        u64::try_from(now).unwrap_or(0)
    }

    fn monotonic_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Manually advanced clock for tests.
///
/// Wall and monotonic readings advance together; `jump_wall_ms` moves only
/// the wall clock to simulate an NTP step.
pub struct ManualClock {
    wall_ms: AtomicU64,
    mono_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            wall_ms: AtomicU64::new(start_ms),
            mono_ms: AtomicU64::new(0),
        })
    }

    /// Advance both wall and monotonic time.
    pub fn advance_ms(&self, delta: u64) {
        self.wall_ms.fetch_add(delta, Ordering::SeqCst);
        self.mono_ms.fetch_add(delta, Ordering::SeqCst);
    }

    /// Move only the wall clock (positive or negative jump).
    pub fn jump_wall_ms(&self, new_wall_ms: u64) {
        self.wall_ms.store(new_wall_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.wall_ms.load(Ordering::SeqCst)
    }

    fn monotonic_ms(&self) -> u64 {
        self.mono_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        assert_eq!(clock.monotonic_ms(), 0);

        clock.advance_ms(250);
        assert_eq!(clock.now_ms(), 1_250);
        assert_eq!(clock.monotonic_ms(), 250);
    }

    #[test]
    fn test_manual_clock_wall_jump_leaves_monotonic() {
        let clock = ManualClock::new(5_000);
        clock.advance_ms(100);
        clock.jump_wall_ms(1_000);

        assert_eq!(clock.now_ms(), 1_000);
        assert_eq!(clock.monotonic_ms(), 100);
    }

    #[test]
    fn test_system_clock_monotonic_does_not_decrease() {
        let clock = SystemClock::new();
        let a = clock.monotonic_ms();
        let b = clock.monotonic_ms();
        assert!(b >= a);
    }
}
