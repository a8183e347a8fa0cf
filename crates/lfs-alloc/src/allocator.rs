//! The segment allocator.
//!
//! Lock order: head gate, then one head, then the arena. The summary of a
//! full head is flushed before the arena is entered, and a queued TRIM over
//! the next block is waited for with no arena lock held.

use crate::flash::FlashModeChooser;
use crate::head::WriteHead;
use crate::strategy::{AllocationStrategy, PlacementView, strategy_for};
use crate::{AllocConfig, Tuning};
use lfs_block::{HeadCursor, MetaStore};
use lfs_discard::DiscardManager;
use lfs_error::{LfsError, Result};
use lfs_segment::{
    DirtyMetaSections, FreeDirtyIndex, GcLevels, MtimeSource, Mutation, SegmentArena,
    SegmentTable, VictimCursor,
};
use lfs_types::{
    AllocDiscipline, AllocMode, BlockAddr, FlashMode, GcMode, NR_KINDS, SegKind, SegmentNo,
};
use lfs_victim::{VictimRequest, VictimSelector};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Who needs the next block.
#[derive(Debug, Clone, Copy)]
enum Origin {
    Writer(AllocDiscipline),
    Relocation {
        mode: AllocMode,
        src_kind: SegKind,
        src_mtime: u64,
    },
}

impl Origin {
    fn is_relocation(self) -> bool {
        matches!(self, Self::Relocation { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Switch {
    Opened,
    Adopted,
}

#[derive(Debug, Default)]
struct Counters {
    lfs_blocks: AtomicU64,
    ssr_blocks: AtomicU64,
    relocated_blocks: AtomicU64,
    new_segments: AtomicU64,
    adopted_segments: AtomicU64,
    summaries_flushed: AtomicU64,
    slc_sections: AtomicU64,
    tlc_sections: AtomicU64,
}

/// Allocation counters since the volume was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocStats {
    /// Writer blocks appended into free segments.
    pub lfs_blocks: u64,
    /// Writer blocks placed into holes of adopted segments.
    pub ssr_blocks: u64,
    /// Blocks placed for the garbage collector.
    pub relocated_blocks: u64,
    pub new_segments: u64,
    pub adopted_segments: u64,
    pub summaries_flushed: u64,
    pub slc_sections: u64,
    pub tlc_sections: u64,
}

/// One write head per kind over a shared [`SegmentArena`].
///
/// Heads switch lazily: a head that fills up stays on its segment until the
/// next allocation for its kind needs a block. The switch rules, in order:
///
/// 1. A head with no segment opens one in a new section.
/// 2. Age-aware relocation adopts a dirty segment whose age is close to the
///    source's, or opens a fresh one.
/// 3. An append head whose next segment in the section is free moves there
///    (or into a new section, if the strategy says so).
/// 4. If slot reuse is wanted, a dirty segment of the kind's class with a
///    reusable block is adopted.
/// 5. Otherwise a fresh segment is opened.
pub struct SegmentAllocator {
    arena: Arc<SegmentArena>,
    selector: VictimSelector,
    discard: Arc<DiscardManager>,
    meta: Arc<dyn MetaStore>,
    clock: Arc<dyn MtimeSource>,
    strategy: Box<dyn AllocationStrategy>,
    config: AllocConfig,
    /// Allocations hold it shared; checkpoints freeze the heads with it.
    gate: RwLock<()>,
    heads: [Mutex<WriteHead>; NR_KINDS],
    tuning: RwLock<Tuning>,
    flash: FlashModeChooser,
    counters: Counters,
}

impl fmt::Debug for SegmentAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentAllocator")
            .field("strategy", &self.strategy.kind())
            .field("config", &self.config)
            .field("tuning", &*self.tuning.read())
            .field("slc_closed", &self.flash.is_closed())
            .finish_non_exhaustive()
    }
}

impl SegmentAllocator {
    #[must_use]
    pub fn new(
        arena: Arc<SegmentArena>,
        selector: VictimSelector,
        discard: Arc<DiscardManager>,
        meta: Arc<dyn MetaStore>,
        clock: Arc<dyn MtimeSource>,
        config: AllocConfig,
        tuning: Tuning,
    ) -> Self {
        Self {
            arena,
            selector,
            discard,
            meta,
            clock,
            strategy: strategy_for(config.strategy, config.no_heap),
            config,
            gate: RwLock::new(()),
            heads: std::array::from_fn(|i| Mutex::new(WriteHead::closed(SegKind::ALL[i]))),
            tuning: RwLock::new(tuning),
            flash: FlashModeChooser::new(),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn arena(&self) -> &Arc<SegmentArena> {
        &self.arena
    }

    #[must_use]
    pub fn config(&self) -> &AllocConfig {
        &self.config
    }

    #[must_use]
    pub fn strategy(&self) -> &dyn AllocationStrategy {
        self.strategy.as_ref()
    }

    #[must_use]
    pub fn tuning(&self) -> Tuning {
        *self.tuning.read()
    }

    pub fn set_gc_mode(&self, mode: GcMode) {
        self.tuning.write().gc_mode = mode;
    }

    pub fn set_dirty_meta(&self, dirty: DirtyMetaSections) {
        self.tuning.write().dirty_meta = dirty;
    }

    pub fn set_levels(&self, levels: GcLevels) {
        self.tuning.write().levels = levels;
    }

    // ── Allocation ──────────────────────────────────────────────────────────

    /// Place one fresh block of `kind`.
    pub fn allocate_block(&self, kind: SegKind, discipline: AllocDiscipline) -> Result<BlockAddr> {
        self.arena.health().check(Mutation::Allocate)?;
        let _gate = self.gate.read();
        let mut head = self.heads[kind.index()].lock();
        self.ensure_space(&mut head, Origin::Writer(discipline))?;
        let addr = self.place(&mut head, None)?;
        let counter = if head.alloc_mode() == AllocMode::Lfs {
            &self.counters.lfs_blocks
        } else {
            &self.counters.ssr_blocks
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(addr)
    }

    /// Place the relocated copy of `src` on the `kind` head.
    ///
    /// The new block inherits the source segment's mtime. `src` stays
    /// valid; the caller invalidates it once the reference is repointed.
    pub fn allocate_for_relocation(
        &self,
        kind: SegKind,
        mode: AllocMode,
        src: BlockAddr,
    ) -> Result<BlockAddr> {
        self.arena.health().check(Mutation::Reclaim)?;
        let (src_kind, src_mtime) = self.arena.read(|table, _| {
            let seg = table
                .segment_of(src)
                .ok_or_else(|| LfsError::consistency(src.0, "relocation source outside main area"))?;
            Ok::<_, LfsError>((table.kind(seg), table.mtime(seg)))
        })?;

        let _gate = self.gate.read();
        let mut head = self.heads[kind.index()].lock();
        let origin = Origin::Relocation {
            mode,
            src_kind,
            src_mtime,
        };
        self.ensure_space(&mut head, origin)?;
        let addr = self.place(&mut head, Some(src_mtime))?;
        self.counters.relocated_blocks.fetch_add(1, Ordering::Relaxed);
        Ok(addr)
    }

    /// Drop a live block. Held off while the heads are frozen, so a
    /// checkpoint journal always matches what it commits.
    pub fn invalidate_block(&self, addr: BlockAddr) -> Result<SegmentNo> {
        let _gate = self.gate.read();
        self.arena.invalidate(addr, self.clock.now())
    }

    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Whether `Auto` writers currently turn to slot reuse.
    #[must_use]
    pub fn need_ssr(&self) -> bool {
        let tuning = self.tuning();
        self.arena
            .read(|table, index| self.need_ssr_in(table, index, &tuning))
    }

    fn need_ssr_in(&self, table: &SegmentTable, index: &FreeDirtyIndex, tuning: &Tuning) -> bool {
        if self.config.lfs_only {
            return false;
        }
        if tuning.gc_mode == GcMode::Urgent || table.checkpoint_disabled() {
            return true;
        }
        let min_ssr = self
            .config
            .min_ssr_sections
            .unwrap_or(tuning.levels.reserved_sections);
        u64::from(index.free_sections())
            <= u64::from(tuning.dirty_meta.headroom())
                + u64::from(min_ssr)
                + u64::from(tuning.levels.reserved_sections)
    }

    fn wants_ssr(&self, origin: Origin, table: &SegmentTable, index: &FreeDirtyIndex, tuning: &Tuning) -> bool {
        if self.config.lfs_only {
            return false;
        }
        match origin {
            Origin::Writer(AllocDiscipline::Append) => false,
            Origin::Writer(AllocDiscipline::SlotReuse)
            | Origin::Relocation {
                mode: AllocMode::Ssr | AllocMode::AgeSsr,
                ..
            } => true,
            Origin::Writer(AllocDiscipline::Auto)
            | Origin::Relocation {
                mode: AllocMode::Lfs,
                ..
            } => self.need_ssr_in(table, index, tuning),
        }
    }

    fn ensure_space(&self, head: &mut WriteHead, origin: Origin) -> Result<()> {
        if head.has_space(self.arena.geometry().blocks_per_seg) {
            return Ok(());
        }
        if head.is_open() {
            self.meta.write_summary(&head.summary())?;
            self.counters.summaries_flushed.fetch_add(1, Ordering::Relaxed);
        }

        let tuning = self.tuning();
        let kind = head.kind();
        let from = head.segno();
        let switched = self
            .arena
            .write(|table, index| self.switch_head(table, index, head, origin, &tuning));
        match switched {
            Ok(how) => {
                tracing::debug!(
                    target: "lfs::alloc",
                    %kind,
                    %from,
                    to = %head.segno(),
                    next_blkoff = head.next_blkoff(),
                    mode = ?head.alloc_mode(),
                    how = ?how,
                    "head_switched"
                );
                Ok(())
            }
            Err(err) => {
                if matches!(err, LfsError::NoSpace) {
                    tracing::warn!(
                        target: "lfs::alloc",
                        %kind,
                        relocation = origin.is_relocation(),
                        "alloc_no_free_segment"
                    );
                }
                Err(err)
            }
        }
    }

    fn switch_head(
        &self,
        table: &mut SegmentTable,
        index: &mut FreeDirtyIndex,
        head: &mut WriteHead,
        origin: Origin,
        tuning: &Tuning,
    ) -> Result<Switch> {
        if !head.is_open() {
            self.open_segment(table, index, head, origin, true, tuning)?;
            return Ok(Switch::Opened);
        }

        if let Origin::Relocation {
            mode: AllocMode::AgeSsr,
            src_kind,
            src_mtime,
        } = origin
        {
            if !self.config.lfs_only {
                if let Some((seg, off)) =
                    self.find_reuse_segment(table, index, src_kind, AllocMode::AgeSsr, src_mtime)
                {
                    self.adopt(table, index, head, seg, off, AllocMode::AgeSsr);
                    return Ok(Switch::Adopted);
                }
            }
            self.open_segment(table, index, head, origin, false, tuning)?;
            return Ok(Switch::Opened);
        }

        if head.alloc_mode() == AllocMode::Lfs
            && !table.checkpoint_disabled()
            && next_segment_free(index, head.segno())
        {
            let new_section = self.strategy.new_section_on_next_free();
            self.open_segment(table, index, head, origin, new_section, tuning)?;
            return Ok(Switch::Opened);
        }

        if self.wants_ssr(origin, table, index, tuning) {
            if let Some((seg, off)) =
                self.find_reuse_segment(table, index, head.kind(), AllocMode::Ssr, 0)
            {
                self.adopt(table, index, head, seg, off, AllocMode::Ssr);
                return Ok(Switch::Adopted);
            }
        }

        self.open_segment(table, index, head, origin, false, tuning)?;
        Ok(Switch::Opened)
    }

    /// A dirty segment with at least one reusable block, searched over the
    /// requested kind first and then the rest of its class.
    fn find_reuse_segment(
        &self,
        table: &mut SegmentTable,
        index: &mut FreeDirtyIndex,
        kind: SegKind,
        mode: AllocMode,
        age: u64,
    ) -> Option<(SegmentNo, u32)> {
        for candidate in reuse_order(kind) {
            let request = match mode {
                AllocMode::AgeSsr => VictimRequest::assr(candidate, age),
                AllocMode::Lfs | AllocMode::Ssr => VictimRequest::ssr(candidate),
            };
            if let Some(victim) = self.selector.select_victim(table, index, &request) {
                if let Some(off) = table.next_reusable_block(victim.segno, 0) {
                    return Some((victim.segno, off));
                }
            }
        }
        if table.checkpoint_disabled() {
            if let Some(seg) = index.free_zero_valid_segment(table) {
                if let Some(off) = table.next_reusable_block(seg, 0) {
                    return Some((seg, off));
                }
            }
        }
        None
    }

    fn adopt(
        &self,
        table: &mut SegmentTable,
        index: &mut FreeDirtyIndex,
        head: &mut WriteHead,
        seg: SegmentNo,
        off: u32,
        mode: AllocMode,
    ) {
        let kind = head.kind();
        let old = head.segno();
        index.forget_dirty(table, seg);
        table.set_current(kind, seg);
        table.set_kind(seg, kind);
        if !old.is_null() && old != seg {
            index.locate_dirty(table, old);
        }
        head.enter(seg, off, mode);
        self.counters.adopted_segments.fetch_add(1, Ordering::Relaxed);
    }

    fn open_segment(
        &self,
        table: &mut SegmentTable,
        index: &mut FreeDirtyIndex,
        head: &mut WriteHead,
        origin: Origin,
        new_section: bool,
        tuning: &Tuning,
    ) -> Result<()> {
        let geo = *table.geometry();
        let kind = head.kind();
        let old = head.segno();
        let view = PlacementView {
            geo,
            checkpoint_disabled: table.checkpoint_disabled(),
            alloc_next: index.last_victim(VictimCursor::AllocNext),
        };
        let placement = self.strategy.placement(kind, old, &view);

        // The SLC head of a section is followed by a new section.
        let leaves_slc = !old.is_null()
            && geo.slc_segs_per_sec > 0
            && kind != SegKind::Fragment
            && (old.0 + 1) % geo.segs_per_sec == geo.slc_segs_per_sec
            && table.section_flash_mode(geo.section_of(old)) == Some(FlashMode::Slc);
        let new_section = new_section || leaves_slc;

        let seg = if !new_section && !old.is_null() && free_in_section_after(index, old) {
            index.acquire_segment(table, old, kind, false, placement.direction)?
        } else {
            index.acquire_segment(table, placement.hint, kind, true, placement.direction)?
        };

        table.set_current(kind, seg);
        table.set_kind(seg, kind);
        if !old.is_null() {
            index.locate_dirty(table, old);
        }
        head.enter(seg, 0, AllocMode::Lfs);
        self.counters.new_segments.fetch_add(1, Ordering::Relaxed);

        let sec = geo.section_of(seg);
        if geo.segs_per_sec > 1 && (old.is_null() || geo.section_of(old) != sec) {
            let mode = self.section_flash_mode(kind, origin, index.free_sections(), tuning);
            table.set_section_flash_mode(sec, Some(mode));
            let counter = match mode {
                FlashMode::Slc => &self.counters.slc_sections,
                FlashMode::Tlc => &self.counters.tlc_sections,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn section_flash_mode(&self, kind: SegKind, origin: Origin, free_secs: u32, tuning: &Tuning) -> FlashMode {
        if kind == SegKind::Fragment {
            return FlashMode::Tlc;
        }
        let band = self
            .flash
            .band(free_secs, &tuning.levels, self.config.slc_enable_interval);
        let slc_enabled = self.config.slc_mode && self.arena.geometry().slc_segs_per_sec > 0;
        if !slc_enabled || origin.is_relocation() {
            return FlashMode::Tlc;
        }
        band.mode_for(kind)
    }

    fn place(&self, head: &mut WriteHead, inherited: Option<u64>) -> Result<BlockAddr> {
        let geo = *self.arena.geometry();
        let seg = head.segno();
        let off = head.next_blkoff();
        let addr = BlockAddr(geo.start_block(seg).0 + u64::from(off));
        self.discard.wait_discard_bio(addr);

        let now = self.clock.now();
        let mode = head.alloc_mode();
        let next = self.arena.write(|table, _| {
            table.mark_valid(addr, now, inherited)?;
            Ok::<_, LfsError>(match mode {
                AllocMode::Lfs => off + 1,
                AllocMode::Ssr | AllocMode::AgeSsr => table
                    .next_reusable_block(seg, off + 1)
                    .unwrap_or(geo.blocks_per_seg),
            })
        })?;
        head.advance(next);
        Ok(addr)
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    /// Cursors of every open head.
    #[must_use]
    pub fn cursors(&self) -> Vec<HeadCursor> {
        self.heads
            .iter()
            .map(|head| head.lock().cursor())
            .filter(|cursor| !cursor.segno.is_null())
            .collect()
    }

    /// Reinstate heads from a checkpoint and rebuild the free/dirty index
    /// around them.
    pub fn restore(&self, cursors: &[HeadCursor]) -> Result<()> {
        let geo = *self.arena.geometry();
        for cursor in cursors {
            if cursor.segno.is_null()
                || cursor.segno.0 >= geo.main_segments
                || cursor.next_blkoff > geo.blocks_per_seg
            {
                return Err(LfsError::consistency(
                    u64::from(cursor.segno.0),
                    format!(
                        "{} head cursor {}+{} out of range",
                        cursor.kind, cursor.segno, cursor.next_blkoff
                    ),
                ));
            }
        }

        let _gate = self.gate.write();
        self.arena.write(|table, _| {
            for cursor in cursors {
                table.set_current(cursor.kind, cursor.segno);
                table.set_kind(cursor.segno, cursor.kind);
            }
        });
        self.arena.rebuild_index();
        for cursor in cursors {
            *self.heads[cursor.kind.index()].lock() = WriteHead::from_cursor(cursor);
        }
        tracing::info!(target: "lfs::alloc", heads = cursors.len(), "heads_restored");
        Ok(())
    }

    /// Stop all allocation until the returned guard is dropped.
    pub fn freeze(&self) -> FrozenHeads<'_> {
        FrozenHeads {
            _gate: self.gate.write(),
            allocator: self,
        }
    }

    #[must_use]
    pub fn stats(&self) -> AllocStats {
        let c = &self.counters;
        AllocStats {
            lfs_blocks: c.lfs_blocks.load(Ordering::Relaxed),
            ssr_blocks: c.ssr_blocks.load(Ordering::Relaxed),
            relocated_blocks: c.relocated_blocks.load(Ordering::Relaxed),
            new_segments: c.new_segments.load(Ordering::Relaxed),
            adopted_segments: c.adopted_segments.load(Ordering::Relaxed),
            summaries_flushed: c.summaries_flushed.load(Ordering::Relaxed),
            slc_sections: c.slc_sections.load(Ordering::Relaxed),
            tlc_sections: c.tlc_sections.load(Ordering::Relaxed),
        }
    }
}

/// Heads held still for a checkpoint.
#[derive(Debug)]
pub struct FrozenHeads<'a> {
    _gate: RwLockWriteGuard<'a, ()>,
    allocator: &'a SegmentAllocator,
}

impl FrozenHeads<'_> {
    #[must_use]
    pub fn cursors(&self) -> Vec<HeadCursor> {
        self.allocator.cursors()
    }

    /// Write the summary of every open head. Returns how many were written.
    pub fn flush_summaries(&self) -> Result<u32> {
        let mut flushed = 0;
        for head in &self.allocator.heads {
            let head = head.lock();
            if head.is_open() {
                self.allocator.meta.write_summary(&head.summary())?;
                flushed += 1;
            }
        }
        self.allocator
            .counters
            .summaries_flushed
            .fetch_add(u64::from(flushed), Ordering::Relaxed);
        Ok(flushed)
    }
}

/// Slot-reuse search order: `kind`, then its class from the cold end for
/// warm and colder kinds, from the hot end otherwise.
fn reuse_order(kind: SegKind) -> Vec<SegKind> {
    let members = kind.class_members();
    let class: Vec<SegKind> = if kind.is_hot() {
        members.to_vec()
    } else {
        members.iter().rev().copied().collect()
    };
    std::iter::once(kind)
        .chain(class.into_iter().filter(|&k| k != kind))
        .collect()
}

fn next_segment_free(index: &FreeDirtyIndex, seg: SegmentNo) -> bool {
    let geo = index.geometry();
    let next = seg.0 + 1;
    next < geo.main_segments && next % geo.segs_per_sec != 0 && !index.is_inuse(SegmentNo(next))
}

fn free_in_section_after(index: &FreeDirtyIndex, seg: SegmentNo) -> bool {
    let geo = index.geometry();
    let end = geo.first_segment(geo.section_of(seg)).0 + geo.segs_per_sec;
    (seg.0 + 1..end.min(geo.main_segments)).any(|s| !index.is_inuse(SegmentNo(s)))
}
