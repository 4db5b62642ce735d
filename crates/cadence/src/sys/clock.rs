//! Monotonic time sources.
//!
//! All scheduling decisions are made in "uptime milliseconds": a signed,
//! non-decreasing count unaffected by wall-clock adjustments.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Source of monotonic uptime in milliseconds
pub trait Clock: Send + Sync {
    /// Current uptime in milliseconds
    fn uptime_millis(&self) -> i64;
}

static PROCESS_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Clock backed by [`Instant`], counting from the first time any
/// `SystemClock` is read in this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    /// Create a system clock
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn uptime_millis(&self) -> i64 {
        let elapsed = PROCESS_EPOCH.elapsed().as_millis();
        // one past zero so that `when == 0` keeps meaning "front of queue"
        i64::try_from(elapsed).unwrap_or(i64::MAX - 1) + 1
    }
}

/// Manually driven clock.
///
/// Time only moves when [`advance`](Self::advance) or [`set`](Self::set) is
/// called. Attempts to move it backwards are ignored.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a clock reading `start` milliseconds
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Move the clock forward by `delta`
    pub fn advance(&self, delta: Duration) {
        let millis = i64::try_from(delta.as_millis()).unwrap_or(i64::MAX);
        self.now.fetch_add(millis, Ordering::AcqRel);
    }

    /// Jump to `millis`, if that is not in the past
    pub fn set(&self, millis: i64) {
        self.now.fetch_max(millis, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn uptime_millis(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }
}
