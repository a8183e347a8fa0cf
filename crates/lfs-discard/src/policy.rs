//! Issue policies.
//!
//! A policy decides which size buckets are eligible in one pass, how many
//! requests each bucket class may send, and how long the worker sleeps
//! afterwards. Buckets are classed by command length: Big (>= 512 blocks),
//! Mid (>= 16) and Small.

use serde::{Deserialize, Serialize};

/// Number of pending buckets; bucket `i` holds commands of `i + 1` blocks,
/// the last one everything at or above 512.
pub const PENDING_BUCKETS: usize = 512;

/// Smallest command length issued by the background policy.
pub const GRAN_BACKGROUND: u32 = 512;
/// Smallest command length issued by the balanced policy.
pub const GRAN_BALANCED: u32 = 16;
pub const GRAN_FORCE: u32 = 1;

/// Pieces are cut at multiples of this many blocks.
pub const DISCARD_ALIGN_BLOCKS: u64 = 512;
/// Upper bound on one submitted piece.
pub const DISCARD_MAX_BLOCKS: u64 = 1024 * 256;

/// Default: 2000 ms.
pub const DEFAULT_MID_INTERVAL_MS: u64 = 2000;
/// Default: 60000 ms.
pub const DEFAULT_MAX_INTERVAL_MS: u64 = 60_000;

const UNLIMITED: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Large commands only, whenever the worker wakes.
    Background,
    /// Low-priority issue that backs off under foreground I/O.
    Balanced,
    /// Everything down to single blocks, still I/O aware.
    Force,
    /// User-requested trim; ignores the idle gate.
    FullTrim,
    /// Final drain before the volume goes away.
    Unmount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    Big,
    Mid,
    Small,
}

impl SizeClass {
    /// Class of pending bucket `bucket`.
    #[must_use]
    pub fn of_bucket(bucket: usize) -> Self {
        let len = bucket + 1;
        if len >= GRAN_BACKGROUND as usize {
            Self::Big
        } else if len >= GRAN_BALANCED as usize {
            Self::Mid
        } else {
            Self::Small
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubPolicy {
    /// Requests a pass may send once it reaches this class; `u32::MAX` is
    /// unlimited.
    pub max_requests: u32,
    /// Worker sleep after a pass that ended in this class.
    pub interval_ms: u64,
}

impl SubPolicy {
    const fn new(max_requests: u32, interval_ms: u64) -> Self {
        Self {
            max_requests,
            interval_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardPolicy {
    pub kind: PolicyKind,
    /// Buckets below this length are not visited.
    pub granularity: u32,
    /// Stop at small buckets while the device is busy.
    pub io_aware: bool,
    /// Buckets below this index are subject to the busy check.
    pub io_aware_gran: u32,
    /// Indexed by [`SizeClass`].
    pub classes: [SubPolicy; 3],
    pub mid_interval_ms: u64,
    pub max_interval_ms: u64,
}

impl DiscardPolicy {
    #[must_use]
    pub fn preset(kind: PolicyKind) -> Self {
        let (granularity, io_aware, io_aware_gran, classes) = match kind {
            PolicyKind::Background | PolicyKind::Unmount => (
                GRAN_BACKGROUND,
                false,
                PENDING_BUCKETS as u32,
                [
                    SubPolicy::new(UNLIMITED, 0),
                    SubPolicy::new(0, 0),
                    SubPolicy::new(0, 0),
                ],
            ),
            PolicyKind::Balanced => (
                GRAN_BALANCED,
                true,
                PENDING_BUCKETS as u32 - 1,
                [
                    SubPolicy::new(1, 0),
                    SubPolicy::new(2, 50),
                    SubPolicy::new(0, 0),
                ],
            ),
            PolicyKind::Force => (
                GRAN_FORCE,
                true,
                PENDING_BUCKETS as u32 - 1,
                [
                    SubPolicy::new(1, 0),
                    SubPolicy::new(2, 50),
                    SubPolicy::new(4, 2000),
                ],
            ),
            PolicyKind::FullTrim => (
                GRAN_FORCE,
                false,
                PENDING_BUCKETS as u32,
                [SubPolicy::new(8, 0); 3],
            ),
        };
        Self {
            kind,
            granularity,
            io_aware,
            io_aware_gran,
            classes,
            mid_interval_ms: DEFAULT_MID_INTERVAL_MS,
            max_interval_ms: DEFAULT_MAX_INTERVAL_MS,
        }
    }

    /// User trim with a caller-chosen minimum length.
    #[must_use]
    pub fn full_trim(minlen: u32) -> Self {
        let mut policy = Self::preset(PolicyKind::FullTrim);
        policy.granularity = minlen.max(1);
        policy
    }

    #[must_use]
    pub fn with_intervals(mut self, mid_interval_ms: u64, max_interval_ms: u64) -> Self {
        self.mid_interval_ms = mid_interval_ms;
        self.max_interval_ms = max_interval_ms;
        self
    }

    /// Sub-policy governing `bucket`. Full trims use Big throughout.
    #[must_use]
    pub fn class_for(&self, bucket: usize) -> SubPolicy {
        let class = if self.kind == PolicyKind::FullTrim {
            SizeClass::Big
        } else {
            SizeClass::of_bucket(bucket)
        };
        self.classes[class.index()]
    }

    /// Largest `max_requests` any class allows.
    #[must_use]
    pub fn window(&self) -> u32 {
        self.classes
            .iter()
            .map(|c| c.max_requests)
            .max()
            .unwrap_or(0)
    }

    /// Policies that run regardless of foreground activity.
    #[must_use]
    pub fn ignores_idle(&self) -> bool {
        matches!(self.kind, PolicyKind::FullTrim | PolicyKind::Unmount)
    }
}

/// Pending bucket for a command of `len` blocks.
#[must_use]
pub fn bucket_of(len: u64) -> usize {
    let capped = usize::try_from(len.min(PENDING_BUCKETS as u64)).unwrap_or(PENDING_BUCKETS);
    capped.max(1) - 1
}

/// Device limit rounded down to the alignment, capped at
/// [`DISCARD_MAX_BLOCKS`]. A device limit below the alignment is used as is.
#[must_use]
pub fn effective_max_discard(device_max: u64) -> u64 {
    let aligned = device_max / DISCARD_ALIGN_BLOCKS * DISCARD_ALIGN_BLOCKS;
    let max = if aligned == 0 { device_max } else { aligned };
    max.clamp(1, DISCARD_MAX_BLOCKS)
}
