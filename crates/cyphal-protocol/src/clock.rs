//! Monotonic time source.
//!
//! Microsecond resolution, anchored at first use. Wall-clock time is never
//! consulted. Deadlines are absolute microsecond values on the same scale.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// A monotonic clock. Implementations must never go backward.
pub trait Clock: Send + Sync {
    /// Microseconds since the clock's epoch.
    fn now_usec(&self) -> u64;

    /// Milliseconds since the clock's epoch.
    fn now_ms(&self) -> u64 {
        self.now_usec() / 1000
    }

    /// Absolute deadline `ms` milliseconds from now.
    fn deadline_in_ms(&self, ms: u64) -> u64 {
        self.now_usec().saturating_add(ms.saturating_mul(1000))
    }

    /// Whether `deadline_usec` has been reached.
    fn is_expired(&self, deadline_usec: u64) -> bool {
        self.now_usec() >= deadline_usec
    }
}

/// Clock backed by `std::time::Instant`.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_usec(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

/// Manually advanced clock for deterministic tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    usec: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            usec: AtomicU64::new(start_ms * 1000),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.usec.fetch_add(ms * 1000, Ordering::SeqCst);
    }

    /// Move the clock to `ms`. Ignored if that would move it backward.
    pub fn set_ms(&self, ms: u64) {
        self.usec.fetch_max(ms * 1000, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_usec(&self) -> u64 {
        self.usec.load(Ordering::SeqCst)
    }
}

fn process_clock() -> &'static MonotonicClock {
    static CLOCK: OnceLock<MonotonicClock> = OnceLock::new();
    CLOCK.get_or_init(MonotonicClock::new)
}

/// Process-wide monotonic microseconds, used to stamp envelopes.
pub fn now_usec() -> u64 {
    process_clock().now_usec()
}

/// Process-wide monotonic milliseconds.
pub fn now_ms() -> u64 {
    process_clock().now_ms()
}
