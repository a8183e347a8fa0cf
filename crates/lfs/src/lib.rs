#![forbid(unsafe_code)]
//! Log-structured segment manager public API facade.
//!
//! Re-exports the volume API from `lfs-core` together with the types and
//! collaborator traits a filesystem layer needs to drive it. This is the
//! crate downstream consumers (CLI, harness) depend on.

pub use lfs_block::{
    BlockDevice, CheckpointReason, IoMonitor, MetaStore, ReferenceResolver, RelocationOffload,
    TrimDevice,
};
pub use lfs_core::*;
pub use lfs_error::{LfsError, Result};
pub use lfs_segment::{ConsistencyPolicy, DirtyMetaSections, GcLevels, SpaceUsage};
pub use lfs_types::{
    AllocDiscipline, BlockAddr, GcMode, Geometry, ObjectRef, SectionNo, SegKind, SegmentNo,
};
