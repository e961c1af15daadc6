//! Time sources.
//!
//! Message `created_at` values are Unix milliseconds; expiry durations are
//! seconds and `expire_at` is a Unix timestamp in seconds. Every write
//! transaction samples the store's [`Clock`] once, so a single commit sees a
//! single "now".

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Returns the current Unix timestamp in seconds.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Source of "now" for the store.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current Unix time in milliseconds.
    fn now_millis(&self) -> i64;

    /// Current Unix time in whole seconds.
    fn now_secs(&self) -> i64 {
        self.now_millis().div_euclid(1000)
    }
}

/// Wall-clock time via chrono.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        now_timestamp_millis()
    }
}

/// A clock that only moves when told to. Used to drive expiry in tests and
/// by hosts that replay history.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at `millis`.
    pub fn new(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    /// Jump to an absolute time.
    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}
