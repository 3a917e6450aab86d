//! Injectable time source.
//!
//! Freshness checks and delegated-token expiry both read the clock through
//! this trait so tests can pin or advance time.

use std::sync::atomic::{AtomicI64, Ordering};

/// Epoch-millisecond timestamp.
pub type EpochMillis = i64;

/// Clock abstraction for cache freshness and token expiry.
pub trait Clock: Send + Sync {
    /// Current time as Unix epoch milliseconds.
    fn now_epoch_millis(&self) -> EpochMillis;
}

/// System clock for production use.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_millis(&self) -> EpochMillis {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Settable clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: EpochMillis) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: EpochMillis) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, delta: i64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_millis(&self) -> EpochMillis {
        self.now.load(Ordering::SeqCst)
    }
}

/// Test clock helpers for common scenarios.
pub mod test_clocks {
    use super::ManualClock;

    /// 2024-01-01 00:00:00 UTC
    pub const BASELINE_MILLIS: i64 = 1_704_067_200_000;

    pub fn baseline() -> ManualClock {
        ManualClock::new(BASELINE_MILLIS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = test_clocks::baseline();
        clock.advance_millis(1_500);
        assert_eq!(clock.now_epoch_millis(), test_clocks::BASELINE_MILLIS + 1_500);
        clock.set(42);
        assert_eq!(clock.now_epoch_millis(), 42);
    }

    #[test]
    fn test_system_clock_is_after_2024() {
        assert!(SystemClock.now_epoch_millis() > test_clocks::BASELINE_MILLIS);
    }
}
