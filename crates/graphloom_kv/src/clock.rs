//! Clock abstraction so rate windows and queue schedules can be
//! driven by a simulated clock in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now_secs(&self) -> f64;
}

/// Wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX_EPOCH")
            .as_secs_f64()
    }
}

/// Test clock advanced by hand. Stores milliseconds to stay atomic.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start_secs: f64) -> Self {
        Self {
            millis: AtomicU64::new((start_secs * 1000.0) as u64),
        }
    }

    pub fn advance(&self, secs: f64) {
        self.millis
            .fetch_add((secs * 1000.0) as u64, Ordering::SeqCst);
    }

    pub fn set(&self, secs: f64) {
        self.millis.store((secs * 1000.0) as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> f64 {
        self.millis.load(Ordering::SeqCst) as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(100.0);
        assert_eq!(clock.now_secs(), 100.0);
        clock.advance(61.5);
        assert_eq!(clock.now_secs(), 161.5);
        clock.set(10.0);
        assert_eq!(clock.now_secs(), 10.0);
    }
}
