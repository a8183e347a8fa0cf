#![forbid(unsafe_code)]
//! Test and simulation support for the segment manager.
//!
//! [`MemVolume`] runs a [`Volume`](lfs::Volume) against in-memory devices
//! and plays the filesystem layer: it owns the block ↔ object map and
//! writes recognisable payloads. [`run_workload`] drives it with a seeded
//! mix of creates, overwrites, deletes, checkpoints, GC runs, trims and
//! remounts, then checks that every live object still reads back intact.

pub mod rig;
pub mod workload;

pub use rig::{MemVolume, payload};
pub use workload::{ReclaimTotals, WorkloadConfig, WorkloadOp, WorkloadReport, run_workload};

use lfs::Geometry;

/// 64 single-segment sections of 32 blocks, 4 reserved and 8
/// overprovisioned. Small enough that workloads reach GC pressure quickly.
#[must_use]
pub fn small_geometry() -> Geometry {
    Geometry {
        blocks_per_seg: 32,
        segs_per_sec: 1,
        secs_per_zone: 1,
        main_blkaddr: 64,
        main_segments: 64,
        reserved_segments: 4,
        overprov_segments: 8,
        slc_segs_per_sec: 0,
    }
}
