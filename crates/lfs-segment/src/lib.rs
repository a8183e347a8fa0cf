#![forbid(unsafe_code)]
//! Segment bookkeeping for the log-structured allocator.
//!
//! ## Design
//!
//! 1. **Bitmap**: fixed-length bit vectors with run and scan helpers.
//! 2. **SegmentTable**: per-segment live/checkpoint/discard bitmaps, valid
//!    counts and mtimes. The single source of truth.
//! 3. **FreeDirtyIndex**: free, dirty and prefree views derived from the
//!    table, plus the victim scan state.
//! 4. **GcLevels**: free-section thresholds and the band policy table.
//! 5. **SegmentArena**: the lock pair that owns table and index.

pub mod arena;
pub mod bitmap;
pub mod clock;
pub mod health;
pub mod index;
pub mod levels;
pub mod table;

pub use arena::{SegmentArena, SpaceUsage};
pub use bitmap::{Bitmap, bitmap_get};
pub use clock::{ManualClock, MonotonicClock, MtimeSource};
pub use health::{ConsistencyPolicy, Mutation, VolumeHealth};
pub use index::{DirtyClass, FreeDirtyIndex, VictimCursor};
pub use levels::{BandPolicy, DirtyMetaSections, GcLevels, MIN_WT_MS, is_fragmented};
pub use table::{SecEntry, SegEntry, SegmentTable};
