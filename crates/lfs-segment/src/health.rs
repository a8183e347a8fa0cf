//! Volume-wide consistency flag.

use lfs_error::{LfsError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// What the volume still allows after a consistency violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyPolicy {
    /// Refuse every mutation.
    #[default]
    Halt,
    /// Refuse allocation and reclaim; invalidations still succeed.
    ReadMostly,
}

/// Class of mutation being gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Allocate,
    Invalidate,
    Reclaim,
    Discard,
}

#[derive(Debug, Default)]
pub struct VolumeHealth {
    need_fsck: AtomicBool,
    violations: AtomicU64,
    policy: ConsistencyPolicy,
}

impl VolumeHealth {
    #[must_use]
    pub fn new(policy: ConsistencyPolicy) -> Self {
        Self {
            need_fsck: AtomicBool::new(false),
            violations: AtomicU64::new(0),
            policy,
        }
    }

    /// Raise the offline-check flag.
    pub fn flag(&self, block: u64, detail: &str) {
        self.violations.fetch_add(1, Ordering::AcqRel);
        if !self.need_fsck.swap(true, Ordering::AcqRel) {
            tracing::error!(
                target: "lfs::health",
                block,
                detail,
                policy = ?self.policy,
                "need_fsck_raised"
            );
        }
    }

    #[must_use]
    pub fn need_fsck(&self) -> bool {
        self.need_fsck.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn policy(&self) -> ConsistencyPolicy {
        self.policy
    }

    /// Fail with `ReadOnly` if `mutation` is no longer permitted.
    pub fn check(&self, mutation: Mutation) -> Result<()> {
        if !self.need_fsck() {
            return Ok(());
        }
        match (self.policy, mutation) {
            (ConsistencyPolicy::ReadMostly, Mutation::Invalidate) => Ok(()),
            _ => Err(LfsError::ReadOnly),
        }
    }
}
