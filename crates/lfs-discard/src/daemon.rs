//! Background discard worker.

use crate::manager::{DiscardManager, DiscardWake, IssueResult};
use crate::policy::DiscardPolicy;
use lfs_error::Result;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Sleep before the next pass.
///
/// After issuing, the worker has already waited for its commands and comes
/// back after the class interval (at least `min_interval_ms`). An
/// interrupted pass retries after `mid_interval_ms`; an idle one after
/// `max_interval_ms`.
#[must_use]
pub fn next_wait_ms(
    result: IssueResult,
    class_interval_ms: u64,
    min_interval_ms: u64,
    policy: &DiscardPolicy,
) -> u64 {
    match result {
        IssueResult::Issued(_) => class_interval_ms.max(min_interval_ms),
        IssueResult::Interrupted => policy.mid_interval_ms,
        IssueResult::Idle => policy.max_interval_ms,
    }
}

/// Handle to the discard worker thread. Dropping it stops the worker.
#[derive(Debug)]
pub struct DiscardWorker {
    manager: Arc<DiscardManager>,
    handle: Option<JoinHandle<()>>,
}

impl DiscardWorker {
    pub fn spawn(manager: Arc<DiscardManager>) -> Result<Self> {
        let worker_manager = Arc::clone(&manager);
        let handle = thread::Builder::new()
            .name("lfs-discard".to_owned())
            .spawn(move || run(&worker_manager))?;
        Ok(Self {
            manager,
            handle: Some(handle),
        })
    }

    /// Stop the worker and wait for it. The current pass, if any, finishes
    /// first.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.manager.signal().notify(DiscardWake::ShutdownRequested);
        if handle.join().is_err() {
            tracing::error!(target: "lfs::discard", "discard_worker_panicked");
        }
    }
}

impl Drop for DiscardWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(manager: &DiscardManager) {
    let config = manager.config();
    let policy = DiscardPolicy::preset(config.worker_policy)
        .with_intervals(config.mid_interval_ms, config.max_interval_ms);
    let mut wait_ms = config.min_interval_ms;
    tracing::debug!(target: "lfs::discard", policy = ?policy.kind, "discard_worker_started");

    loop {
        let reason = manager
            .signal()
            .wait_timeout(Duration::from_millis(wait_ms));
        if reason == Some(DiscardWake::ShutdownRequested) {
            break;
        }
        if !manager.is_enabled() {
            wait_ms = policy.max_interval_ms;
            continue;
        }
        let (result, class_interval) = manager.issue_pass(&policy);
        if matches!(result, IssueResult::Issued(_)) {
            manager.wait_range(&policy, 0, u64::MAX);
        }
        wait_ms = next_wait_ms(result, class_interval, config.min_interval_ms, &policy);
        tracing::trace!(target: "lfs::discard", ?result, wait_ms, "discard_worker_pass");
    }
    tracing::debug!(target: "lfs::discard", "discard_worker_stopped");
}
