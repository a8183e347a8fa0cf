//! Typed wake-up channel for background workers.
//!
//! A worker blocks in [`WakeSignal::wait_timeout`] and is released either by
//! a [`WakeSignal::notify`] carrying a reason, or by the timeout. Pending
//! reasons coalesce: a stronger reason (greater by `Ord`) replaces a weaker
//! one, so a shutdown request is never overwritten by a later nudge.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug)]
pub struct WakeSignal<R> {
    pending: Mutex<Option<R>>,
    cv: Condvar,
}

impl<R: Copy + Ord> Default for WakeSignal<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Copy + Ord> WakeSignal<R> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    /// Post `reason` and wake the waiting worker.
    pub fn notify(&self, reason: R) {
        let mut pending = self.pending.lock();
        *pending = Some(match *pending {
            Some(current) if current > reason => current,
            _ => reason,
        });
        drop(pending);
        self.cv.notify_all();
    }

    /// Block until a reason is posted or `timeout` elapses.
    ///
    /// Returns the posted reason, or `None` on timeout. A reason posted
    /// before the call returns immediately.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<R> {
        let mut pending = self.pending.lock();
        if pending.is_none() {
            let _ = self.cv.wait_for(&mut pending, timeout);
        }
        pending.take()
    }

    /// Take a pending reason without blocking.
    pub fn try_take(&self) -> Option<R> {
        self.pending.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum Reason {
        Nudge,
        Stop,
    }

    #[test]
    fn timeout_returns_none() {
        let sig: WakeSignal<Reason> = WakeSignal::new();
        assert_eq!(sig.wait_timeout(Duration::from_millis(5)), None);
    }

    #[test]
    fn pending_reason_returns_immediately() {
        let sig = WakeSignal::new();
        sig.notify(Reason::Nudge);
        assert_eq!(sig.wait_timeout(Duration::from_secs(60)), Some(Reason::Nudge));
        assert_eq!(sig.try_take(), None);
    }

    #[test]
    fn stronger_reason_is_not_overwritten() {
        let sig = WakeSignal::new();
        sig.notify(Reason::Stop);
        sig.notify(Reason::Nudge);
        assert_eq!(sig.try_take(), Some(Reason::Stop));
    }

    #[test]
    fn notify_wakes_blocked_waiter() {
        let sig = Arc::new(WakeSignal::new());
        let waiter = {
            let sig = Arc::clone(&sig);
            thread::spawn(move || sig.wait_timeout(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(10));
        sig.notify(Reason::Stop);
        assert_eq!(waiter.join().expect("join"), Some(Reason::Stop));
    }
}
