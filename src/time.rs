//! Monotonic time source collaborator.
//!
//! The core never touches the wall clock. Every timestamp in a live-data
//! snapshot, every poll deadline, and every keepalive check flows through
//! this trait so the whole crate can be driven deterministically in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// `now_millis() -> u64`, monotonic, never decreasing.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Production clock anchored to `Instant::now()` at construction.
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
    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Test double: a clock whose value is advanced explicitly by the test, so
/// polling/keepalive/CVL timing logic can be exercised without sleeping.
pub struct FakeClock {
    millis: AtomicU64,
}

impl FakeClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.millis.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_monotonically() {
        let clock = FakeClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        clock.advance(250);
        assert_eq!(clock.now_millis(), 1_250);
        clock.set(5_000);
        assert_eq!(clock.now_millis(), 5_000);
    }
}
