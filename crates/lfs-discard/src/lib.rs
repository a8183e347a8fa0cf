#![forbid(unsafe_code)]
//! TRIM (discard) command management.
//!
//! Freed ranges are queued as commands in an address-ordered tree, merged
//! with their neighbours, and handed to the [`TrimDevice`](lfs_block::TrimDevice)
//! in size-bucketed batches under a [`DiscardPolicy`]. Writers that reuse a
//! queued block call [`DiscardManager::wait_discard_bio`] first so a late
//! TRIM can never destroy fresh data.
//!
//! ## Design
//!
//! - Commands never overlap; only Prepared commands are merged or split.
//! - Piece results arrive on a completion queue separate from the command
//!   lock, so devices may complete inline.
//! - A failed TRIM is logged and forgotten: it costs space efficiency, never
//!   correctness.
//! - Nothing is issued while the volume is flagged for an offline check.

pub mod cmd;
pub mod daemon;
pub mod manager;
pub mod policy;

pub use cmd::{CmdState, DiscardCmd};
pub use daemon::{DiscardWorker, next_wait_ms};
pub use manager::{DiscardManager, DiscardStats, DiscardWake, IssueResult};
pub use policy::{
    DISCARD_MAX_BLOCKS, DiscardPolicy, PENDING_BUCKETS, PolicyKind, SizeClass, SubPolicy,
    bucket_of, effective_max_discard,
};

use lfs_error::{LfsError, Result};
use serde::{Deserialize, Serialize};

/// Discard tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscardConfig {
    /// Queue and issue TRIM at all.
    ///
    /// Default: true.
    pub enabled: bool,
    /// Policy used by the background worker.
    ///
    /// Default: `background`.
    pub worker_policy: PolicyKind,
    /// Worker sleep after a pass that issued.
    ///
    /// Default: 50 ms.
    pub min_interval_ms: u64,
    /// Worker sleep after a pass interrupted by foreground I/O.
    ///
    /// Default: 2000 ms.
    pub mid_interval_ms: u64,
    /// Worker sleep after a pass with nothing to do.
    ///
    /// Default: 60000 ms.
    pub max_interval_ms: u64,
    /// Quiet period after foreground I/O before the device counts as idle.
    ///
    /// Default: 0 ms (idle whenever nothing is in flight).
    pub idle_interval_ms: u64,
    /// Minimum run length collected by a forced checkpoint trim.
    ///
    /// Default: 1 block.
    pub trim_minlen: u32,
}

impl Default for DiscardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_policy: PolicyKind::Background,
            min_interval_ms: 50,
            mid_interval_ms: policy::DEFAULT_MID_INTERVAL_MS,
            max_interval_ms: policy::DEFAULT_MAX_INTERVAL_MS,
            idle_interval_ms: 0,
            trim_minlen: 1,
        }
    }
}

impl DiscardConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_interval_ms > self.max_interval_ms
            || self.mid_interval_ms > self.max_interval_ms
        {
            return Err(LfsError::Config(format!(
                "discard intervals out of order: min={} mid={} max={}",
                self.min_interval_ms, self.mid_interval_ms, self.max_interval_ms
            )));
        }
        if self.trim_minlen == 0 {
            return Err(LfsError::Config("discard trim_minlen must be >= 1".to_owned()));
        }
        if matches!(
            self.worker_policy,
            PolicyKind::FullTrim | PolicyKind::Unmount
        ) {
            return Err(LfsError::Config(format!(
                "{:?} is not a worker policy",
                self.worker_policy
            )));
        }
        Ok(())
    }
}
