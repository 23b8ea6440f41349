//! Wall-clock abstraction.
//!
//! Key expiry and conversation liveness are decided against Unix
//! milliseconds. Production code reads the system clock; tests drive a
//! [`ManualClock`] so expiry boundaries can be crossed without sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current Unix time in milliseconds.
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> i64;
}

/// Reads `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub const fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    /// Jump forward by `by`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// `now + ttl` in Unix milliseconds, saturating.
#[allow(clippy::cast_possible_truncation)]
pub fn deadline_after(now_millis: i64, ttl: Duration) -> i64 {
    now_millis.saturating_add(ttl.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_reasonable() {
        // After 2024-01-01
        assert!(SystemClock.now_millis() > 1_704_067_200_000);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_millis(120_001));
        assert_eq!(clock.now_millis(), 121_001);
        clock.set(5);
        assert_eq!(clock.now_millis(), 5);
    }

    #[test]
    fn deadline_saturates() {
        assert_eq!(deadline_after(i64::MAX - 1, Duration::from_secs(10)), i64::MAX);
        assert_eq!(deadline_after(0, Duration::from_secs(120)), 120_000);
    }
}
