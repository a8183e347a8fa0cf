//! Time source for segment modification times.
//!
//! Segment mtimes are seconds since an arbitrary, volume-stable origin. The
//! age-based victim policies only compare mtimes with each other, so the
//! origin does not matter as long as it is monotonic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub trait MtimeSource: Send + Sync + std::fmt::Debug {
    /// Current time in seconds.
    fn now(&self) -> u64;
}

/// Wall-clock seconds at open plus monotonic elapsed time since.
#[derive(Debug)]
pub struct MonotonicClock {
    base: u64,
    started: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        let base = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        Self {
            base,
            started: Instant::now(),
        }
    }

    /// Resume from a persisted maximum so mtimes never run backwards across
    /// mounts with a skewed wall clock.
    #[must_use]
    pub fn resume_after(floor: u64) -> Self {
        let mut clock = Self::new();
        clock.base = clock.base.max(floor);
        clock
    }
}

impl MtimeSource for MonotonicClock {
    fn now(&self) -> u64 {
        self.base + self.started.elapsed().as_secs()
    }
}

/// Manually advanced clock for deterministic tests and simulation.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, secs: u64) {
        self.now.store(secs, Ordering::Release);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::AcqRel);
    }
}

impl MtimeSource for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now(), 100);
        clock.advance(5);
        assert_eq!(clock.now(), 105);
        clock.set(7);
        assert_eq!(clock.now(), 7);
    }

    #[test]
    fn resumed_clock_never_precedes_floor() {
        let clock = MonotonicClock::resume_after(u64::MAX / 2);
        assert!(clock.now() >= u64::MAX / 2);
    }
}
