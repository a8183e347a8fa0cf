#![forbid(unsafe_code)]
//! Checkpoint pipeline.
//!
//! A checkpoint makes the current segment table durable and is the only
//! point where space comes back: Prefree segments become Free, and blocks
//! invalidated since the previous checkpoint become reusable and are handed
//! to the discard manager.
//!
//! ## Sequence
//!
//! 1. Freeze the write heads (allocation and invalidation wait) and flush
//!    their summaries.
//! 2. Collect the SIT journal and the discard candidates under the arena
//!    read lock.
//! 3. Commit the image through the [`MetaStore`]. A failed commit changes
//!    nothing in memory.
//! 4. Copy live maps to checkpoint maps, promote Prefree to Free and clear
//!    the discard bits of queued ranges.
//! 5. Queue the ranges for TRIM, then thaw the heads. Nothing can land in a
//!    freed range before its TRIM is queued, so a writer always finds (and
//!    punches) the command first.

use lfs_alloc::SegmentAllocator;
use lfs_block::{CheckpointImage, CheckpointReason, MetaStore};
use lfs_discard::DiscardManager;
use lfs_error::Result;
use lfs_segment::{DirtyClass, Mutation};
use lfs_types::{BlockAddr, Geometry, SegmentNo};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Segments a forced trim sweeps, and the shortest interior run it keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimWindow {
    pub start: SegmentNo,
    /// Exclusive.
    pub end: SegmentNo,
    pub minlen: u32,
}

impl TrimWindow {
    /// Window covering the main-area part of blocks `[start, end)`, or
    /// `None` if the range misses the main area.
    #[must_use]
    pub fn for_blocks(geo: &Geometry, start: u64, end: u64, minlen: u32) -> Option<Self> {
        let main_end = geo.main_blkaddr + geo.main_blocks();
        let lo = start.max(geo.main_blkaddr);
        let hi = end.min(main_end);
        if lo >= hi {
            return None;
        }
        let first = geo.segment_of(BlockAddr(lo))?;
        let last = geo.segment_of(BlockAddr(hi - 1))?;
        Some(Self {
            start: first,
            end: SegmentNo(last.0 + 1),
            minlen: minlen.max(1),
        })
    }

    fn segments(self) -> impl Iterator<Item = SegmentNo> {
        (self.start.0..self.end.0).map(SegmentNo)
    }
}

/// Result of one `write_checkpoint` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointOutcome {
    /// Sequence number committed, or the last one if skipped.
    pub seq: u64,
    pub reason: CheckpointReason,
    /// Checkpoints are disabled; nothing was written.
    pub skipped: bool,
    pub summaries: u32,
    pub journaled: u32,
    pub freed_segments: u32,
    pub discard_ranges: u32,
    pub discard_blocks: u64,
}

impl CheckpointOutcome {
    fn skipped(seq: u64, reason: CheckpointReason) -> Self {
        Self {
            seq,
            reason,
            skipped: true,
            summaries: 0,
            journaled: 0,
            freed_segments: 0,
            discard_ranges: 0,
            discard_blocks: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub committed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub last_seq: u64,
    pub journaled_entries: u64,
    pub freed_segments: u64,
    pub discard_blocks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    committed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    journaled_entries: AtomicU64,
    freed_segments: AtomicU64,
    discard_blocks: AtomicU64,
}

pub struct CheckpointPipeline {
    alloc: Arc<SegmentAllocator>,
    discard: Arc<DiscardManager>,
    meta: Arc<dyn MetaStore>,
    /// Last committed sequence number. Held for the whole checkpoint.
    seq: Mutex<u64>,
    counters: Counters,
}

impl fmt::Debug for CheckpointPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointPipeline")
            .field("seq", &*self.seq.lock())
            .field("discard", &self.discard)
            .finish_non_exhaustive()
    }
}

impl CheckpointPipeline {
    /// `last_seq` is the sequence number of the checkpoint the volume was
    /// mounted from, 0 for a fresh volume.
    #[must_use]
    pub fn new(
        alloc: Arc<SegmentAllocator>,
        discard: Arc<DiscardManager>,
        meta: Arc<dyn MetaStore>,
        last_seq: u64,
    ) -> Self {
        Self {
            alloc,
            discard,
            meta,
            seq: Mutex::new(last_seq),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn last_seq(&self) -> u64 {
        *self.seq.lock()
    }

    pub fn write_checkpoint(
        &self,
        reason: CheckpointReason,
        trim: Option<TrimWindow>,
    ) -> Result<CheckpointOutcome> {
        let arena = Arc::clone(self.alloc.arena());
        arena.health().check(Mutation::Reclaim)?;
        let mut last_seq = self.seq.lock();

        if arena.read(|table, _| table.checkpoint_disabled()) {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(target: "lfs::checkpoint", ?reason, "checkpoint_skipped");
            return Ok(CheckpointOutcome::skipped(*last_seq, reason));
        }

        let frozen = self.alloc.freeze();
        let summaries = frozen.flush_summaries()?;

        let geo = *arena.geometry();
        let with_discard = self.discard.is_enabled();
        let (journal, candidates, free_segments, valid_blocks) = arena.read(|table, index| {
            let prefree = index.dirty_map(DirtyClass::Prefree);
            let eligible = |seg: SegmentNo| {
                !prefree.get(seg.0) && !table.is_current_section(geo.section_of(seg))
            };
            let mut candidates: Vec<(SegmentNo, u32, u32)> = Vec::new();
            if with_discard {
                for seg in table.dirty_segments().filter(|&s| eligible(s)) {
                    candidates.extend(
                        table
                            .discard_candidates(seg, false, 1)
                            .into_iter()
                            .map(|(start, len)| (seg, start, len)),
                    );
                }
                if let Some(window) = trim {
                    for seg in window.segments().filter(|&s| eligible(s)) {
                        candidates.extend(
                            table
                                .discard_candidates(seg, true, window.minlen)
                                .into_iter()
                                .map(|(start, len)| (seg, start, len)),
                        );
                    }
                }
            }
            (
                table.dirty_records(),
                candidates,
                index.free_segments() + index.prefree_segments(),
                table.written_valid_blocks(),
            )
        });

        let seq = *last_seq + 1;
        let journaled = u32::try_from(journal.len()).unwrap_or(u32::MAX);
        let image = CheckpointImage {
            seq,
            reason,
            heads: frozen.cursors(),
            sit_journal: journal,
            free_segments,
            valid_blocks,
        };
        if let Err(err) = self.meta.commit_checkpoint(&image) {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                target: "lfs::checkpoint",
                seq,
                ?reason,
                error = %err,
                "checkpoint_commit_failed"
            );
            return Err(err);
        }
        *last_seq = seq;

        let freed = arena.write(|table, index| {
            table.commit_dirty_entries();
            for &(seg, start, len) in &candidates {
                table.mark_discard_queued(seg, start, len);
            }
            let freed = index.promote_prefree(table);
            if with_discard {
                for &(first, count) in &freed {
                    for seg in (first.0..first.0 + count).map(SegmentNo) {
                        table.mark_discard_queued(seg, 0, geo.blocks_per_seg);
                    }
                }
            }
            freed
        });

        let mut discard_blocks = 0_u64;
        if with_discard {
            for &(seg, start, len) in &candidates {
                let addr = BlockAddr(geo.start_block(seg).0 + u64::from(start));
                self.discard.queue(addr, u64::from(len));
                discard_blocks += u64::from(len);
            }
            for &(first, count) in &freed {
                let len = u64::from(count) * u64::from(geo.blocks_per_seg);
                self.discard.queue(geo.start_block(first), len);
                discard_blocks += len;
            }
        }
        drop(frozen);
        if discard_blocks > 0 {
            self.discard.wake();
        }

        let freed_segments: u32 = freed.iter().map(|&(_, count)| count).sum();
        let discard_ranges = u32::try_from(candidates.len() + freed.len()).unwrap_or(u32::MAX);
        let c = &self.counters;
        c.committed.fetch_add(1, Ordering::Relaxed);
        c.journaled_entries.fetch_add(u64::from(journaled), Ordering::Relaxed);
        c.freed_segments.fetch_add(u64::from(freed_segments), Ordering::Relaxed);
        c.discard_blocks.fetch_add(discard_blocks, Ordering::Relaxed);

        tracing::info!(
            target: "lfs::checkpoint",
            seq,
            ?reason,
            summaries,
            journaled,
            freed_segments,
            discard_ranges,
            discard_blocks,
            "checkpoint_committed"
        );
        Ok(CheckpointOutcome {
            seq,
            reason,
            skipped: false,
            summaries,
            journaled,
            freed_segments,
            discard_ranges,
            discard_blocks,
        })
    }

    #[must_use]
    pub fn stats(&self) -> CheckpointStats {
        let c = &self.counters;
        CheckpointStats {
            committed: c.committed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            last_seq: self.last_seq(),
            journaled_entries: c.journaled_entries.load(Ordering::Relaxed),
            freed_segments: c.freed_segments.load(Ordering::Relaxed),
            discard_blocks: c.discard_blocks.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lfs_alloc::{AllocConfig, Tuning};
    use lfs_block::{IoMonitor, MemMetaStore, MemTrimDevice, TrimDevice, TrimMode};
    use lfs_discard::DiscardConfig;
    use lfs_error::LfsError;
    use lfs_segment::{
        ConsistencyPolicy, GcLevels, ManualClock, MtimeSource, SegmentArena, SegmentTable,
        VolumeHealth,
    };
    use lfs_types::{AllocDiscipline, SegKind};
    use lfs_victim::VictimSelector;

    fn geo() -> Geometry {
        Geometry {
            blocks_per_seg: 4,
            segs_per_sec: 1,
            secs_per_zone: 1,
            main_blkaddr: 4,
            main_segments: 8,
            reserved_segments: 0,
            overprov_segments: 0,
            slc_segs_per_sec: 0,
        }
    }

    struct Fixture {
        alloc: Arc<SegmentAllocator>,
        discard: Arc<DiscardManager>,
        meta: Arc<MemMetaStore>,
        pipeline: CheckpointPipeline,
    }

    impl Fixture {
        fn new(table: impl FnOnce(Geometry, Arc<VolumeHealth>) -> SegmentTable) -> Self {
            let g = geo();
            let health = Arc::new(VolumeHealth::new(ConsistencyPolicy::Halt));
            let arena = Arc::new(SegmentArena::new(table(g, Arc::clone(&health))));
            let discard = Arc::new(DiscardManager::new(
                Arc::new(MemTrimDevice::new(1024, TrimMode::Immediate)) as Arc<dyn TrimDevice>,
                Arc::new(IoMonitor::new()),
                health,
                DiscardConfig::default(),
            ));
            let meta = Arc::new(MemMetaStore::new());
            let alloc = Arc::new(SegmentAllocator::new(
                arena,
                VictimSelector::default(),
                Arc::clone(&discard),
                Arc::clone(&meta) as Arc<dyn MetaStore>,
                Arc::new(ManualClock::new(10)) as Arc<dyn MtimeSource>,
                AllocConfig::default(),
                Tuning::new(GcLevels::compute(&g, 0).expect("levels")),
            ));
            let pipeline = CheckpointPipeline::new(
                Arc::clone(&alloc),
                Arc::clone(&discard),
                Arc::clone(&meta) as Arc<dyn MetaStore>,
                0,
            );
            Self {
                alloc,
                discard,
                meta,
                pipeline,
            }
        }

        fn fresh() -> Self {
            Self::new(|g, health| SegmentTable::new(g, health).expect("table"))
        }

        fn alloc_n(&self, n: usize) -> Vec<BlockAddr> {
            (0..n)
                .map(|_| {
                    self.alloc
                        .allocate_block(SegKind::HotData, AllocDiscipline::Auto)
                        .expect("alloc")
                })
                .collect()
        }

        fn shape(&self) -> Vec<(u64, u64)> {
            self.discard
                .commands()
                .into_iter()
                .map(|c| (c.lstart, c.len))
                .collect()
        }
    }

    // ── Promotion ───────────────────────────────────────────────────────────

    #[test]
    fn prefree_becomes_free_only_at_checkpoint() {
        let fx = Fixture::fresh();
        let addrs = fx.alloc_n(5);
        for &addr in &addrs[..4] {
            fx.alloc.invalidate_block(addr).expect("invalidate");
        }
        let arena = fx.alloc.arena();
        let before = arena.usage();
        assert_eq!(before.prefree_segments, 1);
        assert_eq!(before.free_segments, 6);

        let outcome = fx
            .pipeline
            .write_checkpoint(CheckpointReason::Sync, None)
            .expect("checkpoint");
        assert_eq!(outcome.seq, 1);
        assert_eq!(outcome.freed_segments, 1);
        assert_eq!(outcome.journaled, 2);
        assert_eq!(outcome.summaries, 1);

        let after = arena.usage();
        assert_eq!(after.prefree_segments, 0);
        assert_eq!(after.free_segments, 7);
        assert_eq!(fx.shape(), vec![(4, 4)]);
        assert_eq!(fx.meta.commits(), vec![(1, CheckpointReason::Sync)]);
        arena.read(|table, _| table.verify()).expect("consistent");
    }

    #[test]
    fn invalidated_blocks_are_queued_and_become_reusable() {
        let fx = Fixture::fresh();
        fx.alloc_n(5);
        fx.alloc.invalidate_block(BlockAddr(5)).expect("invalidate");
        let arena = fx.alloc.arena();
        arena.read(|table, _| {
            assert_eq!(table.next_reusable_block(SegmentNo(0), 0), None);
        });

        let outcome = fx
            .pipeline
            .write_checkpoint(CheckpointReason::Sync, None)
            .expect("checkpoint");
        assert_eq!(outcome.discard_ranges, 1);
        assert_eq!(fx.shape(), vec![(5, 1)]);
        arena.read(|table, _| {
            assert_eq!(table.ckpt_valid_blocks(SegmentNo(0)), 3);
            assert_eq!(table.next_reusable_block(SegmentNo(0), 0), Some(1));
            assert_eq!(table.dirty_entry_count(), 0);
        });

        let again = fx
            .pipeline
            .write_checkpoint(CheckpointReason::Sync, None)
            .expect("checkpoint");
        assert_eq!(again.seq, 2);
        assert_eq!(again.discard_blocks, 0, "nothing new to trim");
        assert_eq!(fx.shape(), vec![(5, 1)]);
    }

    #[test]
    fn failed_commit_changes_nothing() {
        let fx = Fixture::fresh();
        let addrs = fx.alloc_n(5);
        for &addr in &addrs[..4] {
            fx.alloc.invalidate_block(addr).expect("invalidate");
        }
        fx.meta.fail_next_commits(1);
        let err = fx
            .pipeline
            .write_checkpoint(CheckpointReason::Gc, None)
            .expect_err("injected failure");
        assert!(matches!(err, LfsError::Checkpoint(_)));
        let arena = fx.alloc.arena();
        assert_eq!(arena.usage().prefree_segments, 1);
        assert!(fx.shape().is_empty());
        assert_eq!(fx.pipeline.last_seq(), 0);
        assert_eq!(fx.pipeline.stats().failed, 1);

        let outcome = fx
            .pipeline
            .write_checkpoint(CheckpointReason::Gc, None)
            .expect("retry");
        assert_eq!(outcome.seq, 1);
        assert_eq!(outcome.freed_segments, 1);
    }

    #[test]
    fn disabled_checkpoints_are_skipped() {
        let fx = Fixture::fresh();
        fx.alloc_n(1);
        fx.alloc
            .arena()
            .write(|table, _| table.set_checkpoint_disabled(true));
        let outcome = fx
            .pipeline
            .write_checkpoint(CheckpointReason::Sync, None)
            .expect("skip");
        assert!(outcome.skipped);
        assert!(fx.meta.commits().is_empty());
        assert_eq!(fx.pipeline.stats().skipped, 1);
    }

    #[test]
    fn flagged_volume_refuses_checkpoint() {
        let fx = Fixture::fresh();
        fx.alloc.arena().health().flag(4, "test");
        assert!(matches!(
            fx.pipeline.write_checkpoint(CheckpointReason::Sync, None),
            Err(LfsError::ReadOnly)
        ));
    }

    // ── Forced trim ─────────────────────────────────────────────────────────

    #[test]
    fn forced_trim_sweeps_untrimmed_free_blocks_once() {
        let fx = Fixture::new(|g, health| SegmentTable::restore(g, health, &[]).expect("table"));
        let window = TrimWindow::for_blocks(&geo(), 12, 20, 1).expect("inside main area");
        assert_eq!((window.start, window.end), (SegmentNo(2), SegmentNo(4)));

        let outcome = fx
            .pipeline
            .write_checkpoint(CheckpointReason::Trim, Some(window))
            .expect("checkpoint");
        assert_eq!(outcome.discard_blocks, 8);
        assert_eq!(fx.discard.stats().queued_blocks, 8);

        let again = fx
            .pipeline
            .write_checkpoint(CheckpointReason::Trim, Some(window))
            .expect("checkpoint");
        assert_eq!(again.discard_blocks, 0);
    }

    #[test]
    fn trim_window_clamps_to_main_area() {
        let g = geo();
        assert_eq!(TrimWindow::for_blocks(&g, 0, 4, 1), None);
        let window = TrimWindow::for_blocks(&g, 0, u64::MAX, 0).expect("window");
        assert_eq!((window.start, window.end), (SegmentNo(0), SegmentNo(8)));
        assert_eq!(window.minlen, 1);
        let window = TrimWindow::for_blocks(&g, 9, 10, 1).expect("window");
        assert_eq!((window.start, window.end), (SegmentNo(1), SegmentNo(2)));
    }
}
