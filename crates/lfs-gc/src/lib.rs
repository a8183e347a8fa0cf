#![forbid(unsafe_code)]
//! Garbage collection for the segment manager.
//!
//! A run picks victims one segment at a time, moves their live blocks to
//! the cold heads and lets the checkpoint pipeline turn emptied sections
//! back into free space. Runs are started by the background worker
//! ([`GcDaemon`]), by the write path when allocation fails, or explicitly.
//!
//! ## Design
//!
//! 1. **GcManager**: one run at a time under the GC lock; see
//!    [`GcManager::run`].
//! 2. **Relocation**: two-phase copy then repoint, in `relocate`.
//! 3. **GcScheduler**: pure wake/pressure decision table, unit-tested
//!    without a timer.
//! 4. **GcDaemon**: the worker thread driving the scheduler.

pub mod daemon;
#[cfg(test)]
mod fixture;
pub mod manager;
mod relocate;
pub mod scheduler;

pub use daemon::GcDaemon;
pub use manager::{GcCollaborators, GcManager, GcOutcome, GcStats};
pub use scheduler::{Decision, GcScheduler, PressureSnapshot, SkipReason, WakeReason};

use lfs_error::{LfsError, Result};
use serde::{Deserialize, Serialize};

/// Collector tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Foreground passes on one section that free nothing before the
    /// section is skipped for the rest of the run.
    ///
    /// Default: 10000.
    pub stuck_pass_limit: u32,
    /// Stuck sections after which the volume is flagged for a check.
    ///
    /// Default: 2.
    pub stuck_fsck_limit: u32,
    /// Relocation failures a segment may accumulate before it is
    /// blacklisted.
    ///
    /// Default: 3.
    pub relocation_retry_limit: u32,
    /// Prefree sections above which a non-sync run checkpoints while free
    /// space is below L3.
    ///
    /// Default: 5.
    pub prefree_sec_threshold: u32,
    /// Upper bound on passes in a single run.
    ///
    /// Default: 4096.
    pub max_passes: u32,
    /// Worker sleep in `Urgent` mode.
    ///
    /// Default: 500.
    pub urgent_wait_ms: u64,
    /// Replaces a zero band wait while the device is busy.
    ///
    /// Default: 10.
    pub busy_wait_ms: u64,
    /// Consecutive victimless passes before the worker backs off for
    /// `MIN_WT_MS`.
    ///
    /// Default: 1000.
    pub no_victim_backoff: u32,
    /// Quiet time after the last foreground I/O for the device to count as
    /// idle.
    ///
    /// Default: 0.
    pub idle_interval_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            stuck_pass_limit: 10_000,
            stuck_fsck_limit: 2,
            relocation_retry_limit: 3,
            prefree_sec_threshold: 5,
            max_passes: 4096,
            urgent_wait_ms: 500,
            busy_wait_ms: 10,
            no_victim_backoff: 1000,
            idle_interval_ms: 0,
        }
    }
}

impl GcConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("stuck_pass_limit", self.stuck_pass_limit),
            ("stuck_fsck_limit", self.stuck_fsck_limit),
            ("max_passes", self.max_passes),
            ("no_victim_backoff", self.no_victim_backoff),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(LfsError::Config(format!("{name} must be positive")));
            }
        }
        if self.busy_wait_ms == 0 {
            return Err(LfsError::Config("busy_wait_ms must be positive".to_owned()));
        }
        Ok(())
    }
}
