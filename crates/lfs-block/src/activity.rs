//! Foreground I/O activity tracking for idle-gated background work.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Tracks in-flight and recent foreground I/O.
///
/// The device counts as idle when nothing is in flight and no I/O has been
/// recorded for at least the requested interval.
#[derive(Debug)]
pub struct IoMonitor {
    epoch: Instant,
    inflight: AtomicU64,
    last_io_ms: AtomicU64,
    forced_busy: AtomicBool,
}

impl Default for IoMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl IoMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            inflight: AtomicU64::new(0),
            last_io_ms: AtomicU64::new(0),
            forced_busy: AtomicBool::new(false),
        }
    }

    #[expect(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> u64 {
        // u64 milliseconds cover ~584 million years of uptime.
        self.epoch.elapsed().as_millis() as u64
    }

    /// Record a completed foreground I/O.
    pub fn record_io(&self) {
        self.last_io_ms.store(self.now_ms(), Ordering::Release);
    }

    pub fn begin_io(&self) {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        self.record_io();
    }

    pub fn end_io(&self) {
        // Saturate instead of wrapping on an unmatched end.
        let _ = self
            .inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.record_io();
    }

    /// Pin the monitor busy (or release the pin).
    pub fn set_busy(&self, busy: bool) {
        self.forced_busy.store(busy, Ordering::Release);
    }

    #[must_use]
    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_idle(&self, interval: Duration) -> bool {
        if self.forced_busy.load(Ordering::Acquire) || self.inflight() > 0 {
            return false;
        }
        let last = self.last_io_ms.load(Ordering::Acquire);
        if last == 0 {
            return true;
        }
        let quiet = self.now_ms().saturating_sub(last);
        u128::from(quiet) >= interval.as_millis()
    }
}
