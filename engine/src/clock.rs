//! Local time source.
//!
//! The after-write trigger stamps `userModificationTime` with the local clock.
//! Every clock handed to the store must be non-decreasing, otherwise a later
//! write could be stamped earlier than the one before it.

use crate::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};

/// A source of millisecond timestamps.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the epoch. Never smaller than a
    /// previously returned value.
    fn now(&self) -> Timestamp;
}

/// Wall clock that never runs backwards.
///
/// If the system time steps back (NTP correction, manual change), the last
/// returned value is repeated until the wall clock catches up.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU64,
}

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let wall = chrono::Utc::now().timestamp_millis().max(0) as Timestamp;
        let previous = self.last.fetch_max(wall, Ordering::AcqRel);
        previous.max(wall)
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    current: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: AtomicU64::new(start),
        }
    }

    /// Move the clock to `at`. Ignored if `at` is in the past.
    pub fn set(&self, at: Timestamp) {
        self.current.fetch_max(at, Ordering::AcqRel);
    }

    /// Advance the clock by `millis`.
    pub fn advance(&self, millis: u64) {
        self.current.fetch_add(millis, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.current.load(Ordering::Acquire)
    }
}
