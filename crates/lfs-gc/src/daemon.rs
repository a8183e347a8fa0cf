//! Background GC worker.

use crate::manager::GcManager;
use crate::scheduler::{Decision, GcScheduler, WakeReason};
use lfs_error::{LfsError, Result};
use lfs_types::GcType;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Handle to the GC worker thread. Dropping it stops the worker.
#[derive(Debug)]
pub struct GcDaemon {
    manager: Arc<GcManager>,
    handle: Option<JoinHandle<()>>,
}

impl GcDaemon {
    pub fn spawn(manager: Arc<GcManager>) -> Result<Self> {
        manager.resume();
        let worker_manager = Arc::clone(&manager);
        let handle = thread::Builder::new()
            .name("lfs-gc".to_owned())
            .spawn(move || run(&worker_manager))?;
        Ok(Self {
            manager,
            handle: Some(handle),
        })
    }

    /// Stop the worker and wait for it. A run in progress stops after its
    /// current pass.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.manager.cancel();
        if handle.join().is_err() {
            tracing::error!(target: "lfs::gc", "gc_worker_panicked");
        }
    }
}

impl Drop for GcDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(manager: &GcManager) {
    let mut scheduler = GcScheduler::new(manager.config());
    let mut wait_ms = scheduler.next_wait_ms(&manager.pressure());
    tracing::debug!(target: "lfs::gc", wait_ms, "gc_worker_started");

    loop {
        let wake = manager
            .signal()
            .wait_timeout(Duration::from_millis(wait_ms));
        let pressure = manager.pressure();
        match scheduler.decide(wake, &pressure) {
            Decision::Exit => break,
            Decision::Skip(reason) => {
                tracing::trace!(target: "lfs::gc", ?reason, "gc_worker_skipped");
            }
            Decision::Run(gc_type) => {
                let background = gc_type == GcType::Background;
                match manager.run(false, background, None) {
                    Ok(outcome) => scheduler.record_pass(!outcome.no_victim),
                    Err(LfsError::NoVictim) => scheduler.record_pass(false),
                    Err(LfsError::Cancelled) => break,
                    Err(LfsError::ReadOnly) => {
                        tracing::debug!(target: "lfs::gc", "gc_worker_volume_read_only");
                        scheduler.record_pass(false);
                    }
                    Err(err) => {
                        tracing::warn!(target: "lfs::gc", error = %err, ?gc_type, "gc_worker_run_failed");
                        scheduler.record_pass(false);
                    }
                }
            }
        }
        wait_ms = scheduler.next_wait_ms(&manager.pressure());
        tracing::trace!(target: "lfs::gc", ?wake, wait_ms, "gc_worker_pass");
    }
    tracing::debug!(target: "lfs::gc", "gc_worker_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::Fixture;
    use lfs_types::SegKind;
    use std::time::Instant;

    #[test]
    fn pressure_wake_frees_a_section_and_shutdown_is_prompt() {
        let mut fx = Fixture::new(4);
        fx.write(SegKind::ColdData, 4);
        let hot = fx.write(SegKind::HotData, 28);
        for i in [0, 1, 12, 13] {
            fx.kill(hot[i]);
        }
        assert!(fx.gc.pressure().not_enough_free);

        let mut daemon = GcDaemon::spawn(Arc::clone(&fx.gc)).expect("spawn");
        fx.gc.wake(WakeReason::PressureChanged);
        let deadline = Instant::now() + Duration::from_secs(10);
        while fx.gc.stats().sections_freed == 0 {
            assert!(Instant::now() < deadline, "worker never collected");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(fx.free_sections() >= 1);

        let started = Instant::now();
        daemon.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(fx.gc.is_cancelled());
        daemon.shutdown();
    }

    #[test]
    fn respawn_after_shutdown_accepts_runs_again() {
        let mut fx = Fixture::new(4);
        let a = fx.write(SegKind::HotData, 4);
        fx.write(SegKind::HotData, 1);
        fx.kill(a[0]);

        let mut daemon = GcDaemon::spawn(Arc::clone(&fx.gc)).expect("spawn");
        daemon.shutdown();
        assert!(matches!(fx.gc.run(false, true, None), Err(LfsError::Cancelled)));

        let mut daemon = GcDaemon::spawn(Arc::clone(&fx.gc)).expect("respawn");
        assert!(!fx.gc.is_cancelled());
        daemon.shutdown();
    }
}
