//! Shared home of the segment table and its derived index.
//!
//! Lock order inside the arena is table (`RwLock`) then index (`Mutex`).
//! Callers only get at either through [`SegmentArena::read`] and
//! [`SegmentArena::write`], so the order cannot be inverted. Outer locks
//! (GC, head gate, per-kind heads) must be taken before calling in, and no
//! collaborator I/O may run inside a closure.

use crate::health::{Mutation, VolumeHealth};
use crate::index::{DirtyClass, FreeDirtyIndex};
use crate::table::SegmentTable;
use lfs_error::Result;
use lfs_types::{BlockAddr, Geometry, SegmentNo};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Point-in-time space accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpaceUsage {
    pub free_segments: u32,
    pub free_sections: u32,
    pub prefree_segments: u32,
    pub prefree_sections: u32,
    pub dirty_segments: u32,
    pub dirty_sections: u32,
    pub valid_blocks: u64,
    /// Main-area blocks not holding live data.
    pub free_blocks: u64,
    pub discard_blocks: u64,
    pub unusable_blocks: u64,
}

#[derive(Debug)]
pub struct SegmentArena {
    geo: Geometry,
    health: Arc<VolumeHealth>,
    table: RwLock<SegmentTable>,
    index: Mutex<FreeDirtyIndex>,
}

impl SegmentArena {
    /// Wrap `table`, deriving the index from it.
    #[must_use]
    pub fn new(table: SegmentTable) -> Self {
        let index = FreeDirtyIndex::rebuild(&table);
        Self {
            geo: *table.geometry(),
            health: Arc::clone(table.health()),
            table: RwLock::new(table),
            index: Mutex::new(index),
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    #[must_use]
    pub fn health(&self) -> &Arc<VolumeHealth> {
        &self.health
    }

    pub fn read<R>(&self, f: impl FnOnce(&SegmentTable, &FreeDirtyIndex) -> R) -> R {
        let table = self.table.read();
        let index = self.index.lock();
        f(&table, &index)
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut SegmentTable, &mut FreeDirtyIndex) -> R) -> R {
        let mut table = self.table.write();
        let mut index = self.index.lock();
        f(&mut table, &mut index)
    }

    /// Drop one live block and reclassify its segment.
    pub fn invalidate(&self, addr: BlockAddr, now: u64) -> Result<SegmentNo> {
        self.health.check(Mutation::Invalidate)?;
        self.write(|table, index| {
            let seg = table.mark_invalid(addr, now)?;
            index.locate_dirty(table, seg);
            Ok(seg)
        })
    }

    /// Recompute the index from the table, e.g. after a head restore.
    pub fn rebuild_index(&self) {
        self.write(|table, index| *index = FreeDirtyIndex::rebuild(table));
    }

    #[must_use]
    pub fn usage(&self) -> SpaceUsage {
        self.read(|table, index| SpaceUsage {
            free_segments: index.free_segments(),
            free_sections: index.free_sections(),
            prefree_segments: index.prefree_segments(),
            prefree_sections: index.prefree_sections(),
            dirty_segments: index.nr_dirty(DirtyClass::Dirty),
            dirty_sections: index.dirty_sections(),
            valid_blocks: table.written_valid_blocks(),
            free_blocks: self
                .geo
                .main_blocks()
                .saturating_sub(table.written_valid_blocks()),
            discard_blocks: table.discard_blocks(),
            unusable_blocks: table.unusable_blocks(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ConsistencyPolicy;
    use lfs_error::LfsError;
    use lfs_types::SegKind;

    fn arena() -> SegmentArena {
        let geo = Geometry {
            blocks_per_seg: 4,
            segs_per_sec: 1,
            secs_per_zone: 1,
            main_blkaddr: 4,
            main_segments: 4,
            reserved_segments: 0,
            overprov_segments: 0,
            slc_segs_per_sec: 0,
        };
        let health = Arc::new(VolumeHealth::new(ConsistencyPolicy::Halt));
        SegmentArena::new(SegmentTable::new(geo, health).expect("table"))
    }

    #[test]
    fn invalidate_reclassifies() {
        let arena = arena();
        arena.write(|t, i| {
            i.set_inuse(SegmentNo(1));
            t.set_kind(SegmentNo(1), SegKind::ColdData);
            t.mark_valid(BlockAddr(8), 1, None).expect("valid");
            t.mark_valid(BlockAddr(9), 1, None).expect("valid");
            i.locate_dirty(t, SegmentNo(1));
        });
        assert_eq!(arena.usage().dirty_segments, 1);
        assert_eq!(arena.invalidate(BlockAddr(8), 2).expect("invalidate"), SegmentNo(1));
        arena.invalidate(BlockAddr(9), 2).expect("invalidate");
        let usage = arena.usage();
        assert_eq!(usage.dirty_segments, 0);
        assert_eq!(usage.prefree_segments, 1);
        assert_eq!(usage.free_segments, 3);
        assert_eq!(usage.valid_blocks, 0);
        assert_eq!(usage.free_blocks, 16);
    }

    #[test]
    fn violation_flags_and_halts() {
        let arena = arena();
        let err = arena.invalidate(BlockAddr(8), 1).unwrap_err();
        assert!(matches!(err, LfsError::ConsistencyViolation { .. }));
        assert!(arena.health().need_fsck());
        assert!(matches!(
            arena.invalidate(BlockAddr(8), 1),
            Err(LfsError::ReadOnly)
        ));
    }

    #[test]
    fn rebuild_reflects_table() {
        let arena = arena();
        arena.write(|t, _| {
            t.mark_valid(BlockAddr(12), 1, None).expect("valid");
        });
        assert_eq!(arena.usage().free_segments, 4, "index untouched");
        arena.rebuild_index();
        let usage = arena.usage();
        assert_eq!(usage.free_segments, 3);
        assert_eq!(usage.dirty_segments, 1);
    }
}
