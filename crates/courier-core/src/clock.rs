//! Local receive clock
//!
//! `received_at` stamps come from a [`Clock`]. The clock is only consulted for
//! log placement and timestamp plausibility checks, never for edit ordering.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of local time in milliseconds since the Unix epoch
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in milliseconds
    fn now_millis(&self) -> u64;

    /// Tell the clock about a time already handed out (e.g. the newest stored
    /// `received_at` found on start). Monotonic clocks never go below it.
    fn observe(&self, _millis: u64) {}
}

/// Wall clock that never runs backwards.
///
/// If the system clock steps back, the last value handed out is repeated until
/// wall time catches up.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU64,
}

impl SystemClock {
    /// New clock starting at the current wall time
    pub fn new() -> Self {
        Self::default()
    }

    fn wall_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        let wall = Self::wall_millis();
        let previous = self.last.fetch_max(wall, Ordering::AcqRel);
        previous.max(wall)
    }

    fn observe(&self, millis: u64) {
        self.last.fetch_max(millis, Ordering::AcqRel);
    }
}

/// Manually driven clock, for tests and replay tools
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Clock frozen at `millis`
    pub fn new(millis: u64) -> Self {
        Self {
            now: AtomicU64::new(millis),
        }
    }

    /// Jump to `millis`
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::Release);
    }

    /// Move forward by `millis`
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}
