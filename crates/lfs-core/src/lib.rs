#![forbid(unsafe_code)]
//! Volume facade over the segment manager.
//!
//! [`Volume`] wires the allocator, collector, discard manager and checkpoint
//! pipeline around one [`SegmentArena`](lfs_segment::SegmentArena) and is the
//! only type the filesystem layer talks to.
//!
//! ```ignore
//! let volume = Volume::format(geometry, VolumeConfig::default(), devices)?;
//! volume.start_workers()?;
//! let addr = volume.allocate_block(SegKind::HotData, AllocDiscipline::Auto)?;
//! volume.invalidate_block(addr)?;
//! volume.shutdown()?;
//! ```

pub mod volume;

pub use volume::Volume;

use lfs_alloc::{AllocConfig, AllocStats};
use lfs_block::{
    BlockDevice, IoMonitor, MetaStore, ReferenceResolver, RelocationOffload, TrimDevice,
};
use lfs_checkpoint::CheckpointStats;
use lfs_discard::{DiscardConfig, DiscardStats};
use lfs_error::{LfsError, Result};
use lfs_gc::{GcConfig, GcStats};
use lfs_segment::{ConsistencyPolicy, MtimeSource, SpaceUsage};
use lfs_types::Geometry;
use lfs_victim::VictimConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ── Configuration ───────────────────────────────────────────────────────────

/// Everything tunable about a volume. Loaded from JSON by the CLI; every
/// field may be omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// What still works after a consistency violation.
    ///
    /// Default: `halt`.
    pub consistency: ConsistencyPolicy,
    pub alloc: AllocConfig,
    pub victim: VictimConfig,
    pub discard: DiscardConfig,
    pub gc: GcConfig,
    /// Retry a failed allocation once after a synchronous GC run.
    ///
    /// Default: true.
    pub emergency_gc: bool,
    /// Wake the GC worker when an allocation leaves free sections short.
    ///
    /// Default: true.
    pub wake_gc_on_pressure: bool,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            consistency: ConsistencyPolicy::default(),
            alloc: AllocConfig::default(),
            victim: VictimConfig::default(),
            discard: DiscardConfig::default(),
            gc: GcConfig::default(),
            emergency_gc: true,
            wake_gc_on_pressure: true,
        }
    }
}

impl VolumeConfig {
    /// Check every section against `geo`.
    pub fn validate(&self, geo: &Geometry) -> Result<()> {
        geo.validate()
            .map_err(|e| LfsError::InvalidGeometry(e.to_string()))?;
        self.alloc.validate(geo)?;
        self.victim.validate()?;
        self.discard.validate()?;
        self.gc.validate()
    }
}

// ── Collaborators ───────────────────────────────────────────────────────────

/// Devices and filesystem-layer services a volume runs against.
#[derive(Clone)]
pub struct VolumeDevices {
    /// Data path used for software relocation copies.
    pub device: Arc<dyn BlockDevice>,
    pub trim: Arc<dyn TrimDevice>,
    pub meta: Arc<dyn MetaStore>,
    pub resolver: Arc<dyn ReferenceResolver>,
    pub offload: Option<Arc<dyn RelocationOffload>>,
    pub monitor: Arc<IoMonitor>,
    /// Segment mtime source. `None` uses a monotonic wall clock resumed
    /// after the newest persisted mtime.
    pub clock: Option<Arc<dyn MtimeSource>>,
}

impl std::fmt::Debug for VolumeDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeDevices")
            .field("offload", &self.offload.is_some())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

// ── Stats ───────────────────────────────────────────────────────────────────

/// Point-in-time report across every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub usage: SpaceUsage,
    /// 0..=6, see [`Volume::volume_pressure_level`].
    pub pressure_level: u8,
    pub bad_sections: u32,
    pub need_fsck: bool,
    pub checkpoint_disabled: bool,
    pub alloc: AllocStats,
    pub gc: GcStats,
    pub discard: DiscardStats,
    pub checkpoint: CheckpointStats,
}
