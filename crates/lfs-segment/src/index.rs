//! Free/Dirty Segment Index.
//!
//! Derived views over the [`SegmentTable`]: which segments and sections are
//! free, which are dirty (per kind and in aggregate), which are prefree
//! (empty but still referenced by the last checkpoint), plus the scan state
//! the victim selector keeps between calls. Everything here can be rebuilt
//! from the table with [`FreeDirtyIndex::rebuild`].

use crate::bitmap::Bitmap;
use crate::table::SegmentTable;
use lfs_error::{LfsError, Result};
use lfs_types::{
    AllocDirection, Geometry, NR_KINDS, SPREAD_RADIUS_SECTIONS, SectionNo, SegKind, SegmentNo,
};

/// Dirty bitmap selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyClass {
    Kind(SegKind),
    Dirty,
    Prefree,
}

impl DirtyClass {
    const COUNT: usize = NR_KINDS + 2;

    fn index(self) -> usize {
        match self {
            Self::Kind(kind) => kind.index(),
            Self::Dirty => NR_KINDS,
            Self::Prefree => NR_KINDS + 1,
        }
    }
}

/// Per-policy scan cursors kept between victim searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VictimCursor {
    Greedy,
    CostBenefit,
    AgeThreshold,
    /// Slot-reuse searches.
    AllocNext,
}

impl VictimCursor {
    const COUNT: usize = 4;
}

#[derive(Debug)]
pub struct FreeDirtyIndex {
    geo: Geometry,
    /// Set = in use.
    free_segmap: Bitmap,
    free_secmap: Bitmap,
    free_segments: u32,
    free_sections: u32,
    dirty: Vec<Bitmap>,
    nr_dirty: [u32; DirtyClass::COUNT],
    dirty_secmap: Bitmap,
    /// Sections chosen by background passes, drained first by foreground.
    victim_secmap: Bitmap,
    prefree_in_sec: Vec<u32>,
    prefree_sections: u32,
    cur_victim_sec: Option<SectionNo>,
    gc_skip: Bitmap,
    blacklist: Bitmap,
    last_victim: [u32; VictimCursor::COUNT],
}

impl FreeDirtyIndex {
    /// Index with every segment free.
    #[must_use]
    pub fn new(geo: Geometry) -> Self {
        let secs = geo.main_sections();
        Self {
            geo,
            free_segmap: Bitmap::new(geo.main_segments),
            free_secmap: Bitmap::new(secs),
            free_segments: geo.main_segments,
            free_sections: secs,
            dirty: (0..DirtyClass::COUNT)
                .map(|_| Bitmap::new(geo.main_segments))
                .collect(),
            nr_dirty: [0; DirtyClass::COUNT],
            dirty_secmap: Bitmap::new(secs),
            victim_secmap: Bitmap::new(secs),
            prefree_in_sec: vec![0; secs as usize],
            prefree_sections: 0,
            cur_victim_sec: None,
            gc_skip: Bitmap::new(secs),
            blacklist: Bitmap::new(secs),
            last_victim: [0; VictimCursor::COUNT],
        }
    }

    /// Derive the index from `table`. Segments with no valid blocks that no
    /// write head occupies are free; everything else is classified.
    #[must_use]
    pub fn rebuild(table: &SegmentTable) -> Self {
        let geo = *table.geometry();
        let mut index = Self::new(geo);
        for seg in (0..geo.main_segments).map(SegmentNo) {
            if table.valid_blocks(seg) > 0 || table.is_current_segment(seg) {
                index.set_inuse(seg);
            }
        }
        for seg in (0..geo.main_segments).map(SegmentNo) {
            if index.is_inuse(seg) && table.valid_blocks(seg) > 0 {
                index.locate_dirty(table, seg);
            }
        }
        index
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    // ── Free maps ───────────────────────────────────────────────────────────

    #[must_use]
    pub fn free_segments(&self) -> u32 {
        self.free_segments
    }

    #[must_use]
    pub fn free_sections(&self) -> u32 {
        self.free_sections
    }

    #[must_use]
    pub fn is_inuse(&self, seg: SegmentNo) -> bool {
        self.free_segmap.get(seg.0)
    }

    #[must_use]
    pub fn is_section_free(&self, sec: SectionNo) -> bool {
        !self.free_secmap.get(sec.0)
    }

    /// Mark `seg` (and its section) in use.
    pub fn set_inuse(&mut self, seg: SegmentNo) {
        if !self.free_segmap.test_and_set(seg.0) {
            self.free_segments -= 1;
        }
        let sec = self.geo.section_of(seg);
        if !self.free_secmap.test_and_set(sec.0) {
            self.free_sections -= 1;
        }
    }

    /// Mark `seg` free; its section becomes free once all members are.
    pub fn set_free(&mut self, seg: SegmentNo) {
        if !self.free_segmap.test_and_clear(seg.0) {
            return;
        }
        self.free_segments += 1;
        let sec = self.geo.section_of(seg);
        let start = self.geo.first_segment(sec).0;
        let end = start + self.geo.segs_per_sec;
        let busy = self.free_segmap.next_set(start).is_some_and(|s| s < end);
        if !busy && self.free_secmap.test_and_clear(sec.0) {
            self.free_sections += 1;
        }
    }

    // ── Dirty maps ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn dirty_map(&self, class: DirtyClass) -> &Bitmap {
        &self.dirty[class.index()]
    }

    #[must_use]
    pub fn nr_dirty(&self, class: DirtyClass) -> u32 {
        self.nr_dirty[class.index()]
    }

    #[must_use]
    pub fn dirty_secmap(&self) -> &Bitmap {
        &self.dirty_secmap
    }

    #[must_use]
    pub fn dirty_sections(&self) -> u32 {
        self.dirty_secmap.count_ones()
    }

    #[must_use]
    pub fn prefree_segments(&self) -> u32 {
        self.nr_dirty(DirtyClass::Prefree)
    }

    /// Sections whose every segment is prefree.
    #[must_use]
    pub fn prefree_sections(&self) -> u32 {
        self.prefree_sections
    }

    fn mark_class(&mut self, table: &SegmentTable, seg: SegmentNo, class: DirtyClass) {
        if table.is_current_segment(seg) {
            return;
        }
        if self.dirty[class.index()].test_and_set(seg.0) {
            return;
        }
        self.nr_dirty[class.index()] += 1;
        let sec = self.geo.section_of(seg);
        match class {
            DirtyClass::Dirty => {
                let kind = DirtyClass::Kind(table.kind(seg));
                if !self.dirty[kind.index()].test_and_set(seg.0) {
                    self.nr_dirty[kind.index()] += 1;
                }
                if !table.is_current_section(sec) {
                    self.dirty_secmap.set(sec.0);
                }
            }
            DirtyClass::Prefree => {
                self.prefree_in_sec[sec.index()] += 1;
                if self.prefree_in_sec[sec.index()] == self.geo.segs_per_sec {
                    self.prefree_sections += 1;
                }
            }
            DirtyClass::Kind(_) => {}
        }
    }

    fn unmark_class(&mut self, table: &SegmentTable, seg: SegmentNo, class: DirtyClass) {
        if self.dirty[class.index()].test_and_clear(seg.0) {
            self.nr_dirty[class.index()] -= 1;
            if class == DirtyClass::Prefree {
                let sec = self.geo.section_of(seg);
                if self.prefree_in_sec[sec.index()] == self.geo.segs_per_sec {
                    self.prefree_sections -= 1;
                }
                self.prefree_in_sec[sec.index()] -= 1;
            }
        }
        if class != DirtyClass::Dirty {
            return;
        }
        // The segment may have been filed under a previous kind.
        for kind in SegKind::ALL {
            let idx = DirtyClass::Kind(kind).index();
            if self.dirty[idx].test_and_clear(seg.0) {
                self.nr_dirty[idx] -= 1;
            }
        }
        let sec = self.geo.section_of(seg);
        let valid = u64::from(table.section_valid_blocks(sec));
        if valid == 0 {
            self.victim_secmap.clear(sec.0);
        }
        if valid == 0 || valid == self.geo.blocks_per_sec() {
            self.dirty_secmap.clear(sec.0);
        }
    }

    /// Reclassify `seg` after its valid count changed.
    pub fn locate_dirty(&mut self, table: &SegmentTable, seg: SegmentNo) {
        if seg.is_null() || table.is_current_segment(seg) {
            return;
        }
        let full = self.geo.blocks_per_seg;
        let valid = table.valid_blocks(seg);
        let ckpt_valid = table.ckpt_valid_blocks(seg);
        if valid == 0 && (!table.checkpoint_disabled() || ckpt_valid == full) {
            self.mark_class(table, seg, DirtyClass::Prefree);
            self.unmark_class(table, seg, DirtyClass::Dirty);
        } else if valid < full {
            self.mark_class(table, seg, DirtyClass::Dirty);
        } else {
            self.unmark_class(table, seg, DirtyClass::Dirty);
        }
    }

    /// Drop `seg` from the prefree and dirty maps (a write head adopted it).
    pub fn forget_dirty(&mut self, table: &SegmentTable, seg: SegmentNo) {
        self.unmark_class(table, seg, DirtyClass::Prefree);
        self.unmark_class(table, seg, DirtyClass::Dirty);
    }

    /// Dirty segment with no valid and no checkpoint-valid blocks.
    #[must_use]
    pub fn free_zero_valid_segment(&self, table: &SegmentTable) -> Option<SegmentNo> {
        self.dirty_map(DirtyClass::Dirty)
            .iter_ones()
            .map(SegmentNo)
            .find(|&seg| {
                table.valid_blocks(seg) == 0
                    && table.ckpt_valid_blocks(seg) == 0
                    && !table.is_current_segment(seg)
            })
    }

    /// Move every prefree segment to free. Returns the freed runs as
    /// `(first segment, count)` for discard.
    pub fn promote_prefree(&mut self, table: &SegmentTable) -> Vec<(SegmentNo, u32)> {
        let runs: Vec<(u32, u32)> = self.dirty_map(DirtyClass::Prefree).runs().collect();
        for &(start, len) in &runs {
            for seg in (start..start + len).map(SegmentNo) {
                self.unmark_class(table, seg, DirtyClass::Prefree);
                self.set_free(seg);
            }
        }
        runs.into_iter()
            .map(|(start, len)| (SegmentNo(start), len))
            .collect()
    }

    // ── Acquisition ─────────────────────────────────────────────────────────

    /// Acquire a free segment near `hint` and mark it in use.
    ///
    /// Never returns a segment in the current foreground victim section.
    /// Zones hosting another write head are avoided once when
    /// `secs_per_zone > 1`.
    pub fn acquire_segment(
        &mut self,
        table: &SegmentTable,
        hint: SegmentNo,
        kind: SegKind,
        force_new_section: bool,
        direction: AllocDirection,
    ) -> Result<SegmentNo> {
        let geo = self.geo;
        let hint = if hint.is_null() || hint.0 >= geo.main_segments {
            SegmentNo(0)
        } else {
            hint
        };

        if !force_new_section && (hint.0 + 1) % geo.segs_per_sec != 0 {
            let sec_end = geo.first_segment(geo.section_of(hint)).0 + geo.segs_per_sec;
            if let Some(seg) = self.free_segmap.next_zero(hint.0 + 1).filter(|&s| s < sec_end) {
                self.set_inuse(SegmentNo(seg));
                return Ok(SegmentNo(seg));
            }
        }

        let secno = match direction {
            AllocDirection::SpreadFromCenter => self.spread_section()?,
            AllocDirection::TowardMax | AllocDirection::TowardZero => {
                self.directed_section(table, geo.section_of(hint), kind, direction)?
            }
        };
        let seg = geo.first_segment(secno);
        if self.free_segmap.get(seg.0) {
            return Err(LfsError::consistency(
                geo.start_block(seg).0,
                "free section starts with an in-use segment",
            ));
        }
        self.set_inuse(seg);
        Ok(seg)
    }

    fn usable_free_section(&self, sec: u32) -> bool {
        !self.free_secmap.get(sec) && self.cur_victim_sec != Some(SectionNo(sec))
    }

    fn next_free_section(&self, from: u32) -> Option<u32> {
        let total = self.geo.main_sections();
        let mut cursor = from;
        while cursor < total {
            let sec = self.free_secmap.next_zero(cursor)?;
            if self.usable_free_section(sec) {
                return Some(sec);
            }
            cursor = sec + 1;
        }
        None
    }

    fn prev_free_section(&self, from: u32) -> Option<u32> {
        let mut cursor = from;
        loop {
            let sec = self.free_secmap.prev_zero(cursor)?;
            if self.usable_free_section(sec) {
                return Some(sec);
            }
            cursor = sec.checked_sub(1)?;
        }
    }

    fn directed_section(
        &self,
        table: &SegmentTable,
        hint_sec: SectionNo,
        kind: SegKind,
        direction: AllocDirection,
    ) -> Result<SectionNo> {
        let geo = self.geo;
        let total_zones = geo.main_zones();
        let old_zone = geo.zone_of(hint_sec);
        let busy_zones = table.current_zones(kind);
        let mut hint = hint_sec.0;
        let mut retry_zone = true;

        loop {
            let (secno, went_left) = match self.next_free_section(hint) {
                Some(sec) => (sec, false),
                None if direction == AllocDirection::TowardMax => {
                    (self.next_free_section(0).ok_or(LfsError::NoSpace)?, false)
                }
                None => {
                    let left = hint
                        .checked_sub(1)
                        .and_then(|from| self.prev_free_section(from))
                        .or_else(|| self.next_free_section(0))
                        .ok_or(LfsError::NoSpace)?;
                    (left, true)
                }
            };

            let zone = geo.zone_of(SectionNo(secno));
            let settle = !retry_zone
                || geo.secs_per_zone == 1
                || zone == old_zone
                || (direction == AllocDirection::TowardZero
                    && ((!went_left && zone.0 + 1 >= total_zones) || (went_left && zone.0 == 0)));
            if settle || !busy_zones.contains(&zone) {
                return Ok(SectionNo(secno));
            }

            hint = if went_left {
                (zone.0 * geo.secs_per_zone).saturating_sub(1)
            } else if zone.0 + 1 >= total_zones {
                0
            } else {
                (zone.0 + 1) * geo.secs_per_zone
            };
            retry_zone = false;
        }
    }

    /// Alternate fixed-width windows right and left of the middle section.
    fn spread_section(&self) -> Result<SectionNo> {
        let total = self.geo.main_sections();
        let mid = total / 2;
        let width = SPREAD_RADIUS_SECTIONS;
        let mut step = 0_u32;
        loop {
            let right_lo = mid.saturating_add(step.saturating_mul(width));
            let left_hi = mid.checked_sub(step.saturating_mul(width));
            if right_lo >= total && left_hi.is_none_or(|hi| hi == 0) {
                return Err(LfsError::NoSpace);
            }
            if right_lo < total {
                let right_hi = right_lo.saturating_add(width).min(total);
                if let Some(sec) = self.next_free_section(right_lo).filter(|&s| s < right_hi) {
                    return Ok(SectionNo(sec));
                }
            }
            if let Some(hi) = left_hi.filter(|&hi| hi > 0) {
                let lo = hi.saturating_sub(width);
                if let Some(sec) = self.prev_free_section(hi - 1).filter(|&s| s >= lo) {
                    return Ok(SectionNo(sec));
                }
            }
            step += 1;
        }
    }

    // ── Victim scan state ───────────────────────────────────────────────────

    #[must_use]
    pub fn cur_victim_sec(&self) -> Option<SectionNo> {
        self.cur_victim_sec
    }

    pub fn set_cur_victim_sec(&mut self, sec: Option<SectionNo>) {
        self.cur_victim_sec = sec;
    }

    #[must_use]
    pub fn victim_secmap(&self) -> &Bitmap {
        &self.victim_secmap
    }

    pub fn set_bg_victim(&mut self, sec: SectionNo) {
        self.victim_secmap.set(sec.0);
    }

    pub fn clear_bg_victim(&mut self, sec: SectionNo) {
        self.victim_secmap.clear(sec.0);
    }

    /// In the per-run skip set.
    #[must_use]
    pub fn is_run_skipped(&self, sec: SectionNo) -> bool {
        self.gc_skip.get(sec.0)
    }

    #[must_use]
    pub fn is_blacklisted(&self, sec: SectionNo) -> bool {
        self.blacklist.get(sec.0)
    }

    pub fn skip_for_run(&mut self, sec: SectionNo) {
        self.gc_skip.set(sec.0);
    }

    pub fn clear_run_skips(&mut self) {
        self.gc_skip.clear_all();
    }

    /// Exclude `sec` from reclaim until remount.
    pub fn blacklist(&mut self, sec: SectionNo) {
        self.blacklist.set(sec.0);
    }

    #[must_use]
    pub fn blacklisted_sections(&self) -> u32 {
        self.blacklist.count_ones()
    }

    #[must_use]
    pub fn last_victim(&self, cursor: VictimCursor) -> u32 {
        self.last_victim[cursor as usize]
    }

    pub fn set_last_victim(&mut self, cursor: VictimCursor, seg: u32) {
        self.last_victim[cursor as usize] = seg;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{ConsistencyPolicy, VolumeHealth};
    use lfs_types::BlockAddr;
    use std::sync::Arc;

    fn geo(segs_per_sec: u32, secs_per_zone: u32, main_segments: u32) -> Geometry {
        Geometry {
            blocks_per_seg: 8,
            segs_per_sec,
            secs_per_zone,
            main_blkaddr: 8,
            main_segments,
            reserved_segments: 0,
            overprov_segments: 0,
            slc_segs_per_sec: 0,
        }
    }

    fn setup(g: Geometry) -> (SegmentTable, FreeDirtyIndex) {
        let table = SegmentTable::new(g, Arc::new(VolumeHealth::new(ConsistencyPolicy::Halt)))
            .expect("table");
        (table, FreeDirtyIndex::new(g))
    }

    fn fill(table: &mut SegmentTable, seg: u32, blocks: u32) {
        let start = table.geometry().start_block(SegmentNo(seg)).0;
        for off in 0..blocks {
            table
                .mark_valid(BlockAddr(start + u64::from(off)), 1, None)
                .expect("valid");
        }
    }

    // ── Classification ──────────────────────────────────────────────────

    #[test]
    fn locate_dirty_tracks_lifecycle() {
        let (mut t, mut idx) = setup(geo(1, 1, 8));
        idx.set_inuse(SegmentNo(2));
        fill(&mut t, 2, 3);
        idx.locate_dirty(&t, SegmentNo(2));
        assert!(idx.dirty_map(DirtyClass::Dirty).get(2));
        assert!(idx.dirty_map(DirtyClass::Kind(SegKind::HotData)).get(2));
        assert!(idx.dirty_secmap().get(2));

        fill(&mut t, 2, 0);
        let start = t.geometry().start_block(SegmentNo(2)).0;
        for off in 3..8 {
            t.mark_valid(BlockAddr(start + off), 1, None).expect("valid");
        }
        idx.locate_dirty(&t, SegmentNo(2));
        assert!(!idx.dirty_map(DirtyClass::Dirty).get(2), "full leaves dirty");
        assert!(!idx.dirty_secmap().get(2));

        for off in 0..8 {
            t.mark_invalid(BlockAddr(start + off), 2).expect("invalid");
        }
        idx.locate_dirty(&t, SegmentNo(2));
        assert!(idx.dirty_map(DirtyClass::Prefree).get(2));
        assert_eq!(idx.prefree_segments(), 1);
        assert_eq!(idx.prefree_sections(), 1);
        assert_eq!(idx.free_segments(), 7, "prefree is not free");
    }

    #[test]
    fn current_segments_are_never_classified() {
        let (mut t, mut idx) = setup(geo(1, 1, 8));
        idx.set_inuse(SegmentNo(1));
        t.set_current(SegKind::WarmData, SegmentNo(1));
        fill(&mut t, 1, 2);
        idx.locate_dirty(&t, SegmentNo(1));
        assert_eq!(idx.nr_dirty(DirtyClass::Dirty), 0);
    }

    #[test]
    fn prefree_becomes_free_only_on_promotion() {
        let (mut t, mut idx) = setup(geo(1, 1, 8));
        for seg in [3, 4, 6] {
            idx.set_inuse(SegmentNo(seg));
            fill(&mut t, seg, 1);
            let a = t.geometry().start_block(SegmentNo(seg));
            t.mark_invalid(a, 2).expect("invalid");
            idx.locate_dirty(&t, SegmentNo(seg));
        }
        assert_eq!(idx.free_segments(), 5);
        let runs = idx.promote_prefree(&t);
        assert_eq!(runs, vec![(SegmentNo(3), 2), (SegmentNo(6), 1)]);
        assert_eq!(idx.free_segments(), 8);
        assert_eq!(idx.free_sections(), 8);
        assert_eq!(idx.prefree_segments(), 0);
    }

    #[test]
    fn section_frees_only_when_all_members_free() {
        let (_t, mut idx) = setup(geo(4, 1, 8));
        idx.set_inuse(SegmentNo(0));
        idx.set_inuse(SegmentNo(1));
        assert_eq!(idx.free_sections(), 1);
        idx.set_free(SegmentNo(0));
        assert_eq!(idx.free_sections(), 1);
        idx.set_free(SegmentNo(1));
        assert_eq!(idx.free_sections(), 2);
        assert_eq!(idx.free_segments(), 8);
    }

    // ── Acquisition ─────────────────────────────────────────────────────

    #[test]
    fn acquire_prefers_same_section_then_moves_on() {
        let (t, mut idx) = setup(geo(2, 1, 8));
        let first = idx
            .acquire_segment(&t, SegmentNo(0), SegKind::HotData, true, AllocDirection::TowardMax)
            .expect("acquire");
        assert_eq!(first, SegmentNo(0));
        let second = idx
            .acquire_segment(&t, first, SegKind::HotData, false, AllocDirection::TowardMax)
            .expect("acquire");
        assert_eq!(second, SegmentNo(1), "next segment of the same section");
        let third = idx
            .acquire_segment(&t, second, SegKind::HotData, false, AllocDirection::TowardMax)
            .expect("acquire");
        assert_eq!(third, SegmentNo(2));
    }

    #[test]
    fn toward_max_wraps_and_toward_zero_walks_left() {
        let (t, mut idx) = setup(geo(1, 1, 4));
        for seg in [0, 3] {
            idx.set_inuse(SegmentNo(seg));
        }
        let right = idx
            .acquire_segment(&t, SegmentNo(3), SegKind::WarmData, true, AllocDirection::TowardMax)
            .expect("wrap");
        assert_eq!(right, SegmentNo(1));
        let left = idx
            .acquire_segment(&t, SegmentNo(3), SegKind::HotNode, true, AllocDirection::TowardZero)
            .expect("left");
        assert_eq!(left, SegmentNo(2));
        assert!(matches!(
            idx.acquire_segment(&t, SegmentNo(0), SegKind::HotNode, true, AllocDirection::TowardZero),
            Err(LfsError::NoSpace)
        ));
    }

    #[test]
    fn acquire_skips_current_victim_section() {
        let (t, mut idx) = setup(geo(1, 1, 4));
        idx.set_cur_victim_sec(Some(SectionNo(0)));
        let seg = idx
            .acquire_segment(&t, SegmentNo(0), SegKind::HotData, true, AllocDirection::TowardMax)
            .expect("acquire");
        assert_eq!(seg, SegmentNo(1));
    }

    #[test]
    fn acquire_avoids_zone_of_another_head_once() {
        let (mut t, mut idx) = setup(geo(1, 2, 8));
        idx.set_inuse(SegmentNo(0));
        t.set_current(SegKind::ColdData, SegmentNo(2));
        idx.set_inuse(SegmentNo(2));
        // Section 3 is the first free one but shares zone 1 with the cold
        // head, so the search moves on to zone 2.
        idx.set_inuse(SegmentNo(1));
        let seg = idx
            .acquire_segment(&t, SegmentNo(1), SegKind::HotData, true, AllocDirection::TowardMax)
            .expect("acquire");
        assert_eq!(seg, SegmentNo(4));
    }

    #[test]
    fn spread_starts_from_the_middle() {
        let (t, mut idx) = setup(geo(1, 1, 64));
        let seg = idx
            .acquire_segment(&t, SegmentNo::NULL, SegKind::WarmData, true, AllocDirection::SpreadFromCenter)
            .expect("spread");
        assert_eq!(seg, SegmentNo(32));
        for s in 32..40 {
            idx.set_inuse(SegmentNo(s));
        }
        let seg = idx
            .acquire_segment(&t, SegmentNo::NULL, SegKind::WarmData, true, AllocDirection::SpreadFromCenter)
            .expect("spread");
        assert_eq!(seg, SegmentNo(31), "left window after right window is full");
    }

    #[test]
    fn spread_reports_no_space_when_full() {
        let (t, mut idx) = setup(geo(1, 1, 4));
        for s in 0..4 {
            idx.set_inuse(SegmentNo(s));
        }
        assert!(matches!(
            idx.acquire_segment(&t, SegmentNo::NULL, SegKind::WarmData, true, AllocDirection::SpreadFromCenter),
            Err(LfsError::NoSpace)
        ));
    }

    #[test]
    fn rebuild_matches_incremental_state() {
        let (mut t, mut idx) = setup(geo(1, 1, 8));
        for (seg, blocks) in [(1, 8), (2, 3), (5, 1)] {
            idx.set_inuse(SegmentNo(seg));
            fill(&mut t, seg, blocks);
            idx.locate_dirty(&t, SegmentNo(seg));
        }
        let rebuilt = FreeDirtyIndex::rebuild(&t);
        assert_eq!(rebuilt.free_segments(), idx.free_segments());
        assert_eq!(
            rebuilt.dirty_map(DirtyClass::Dirty),
            idx.dirty_map(DirtyClass::Dirty)
        );
        assert_eq!(rebuilt.dirty_secmap(), idx.dirty_secmap());
    }

    #[test]
    fn zero_valid_segment_found_only_when_checkpoint_clear() {
        let (mut t, mut idx) = setup(geo(1, 1, 4));
        t.set_checkpoint_disabled(true);
        idx.set_inuse(SegmentNo(2));
        fill(&mut t, 2, 1);
        let a = t.geometry().start_block(SegmentNo(2));
        t.mark_invalid(a, 2).expect("invalid");
        idx.locate_dirty(&t, SegmentNo(2));
        assert!(idx.dirty_map(DirtyClass::Dirty).get(2), "stays dirty while checkpoints are off");
        assert_eq!(idx.free_zero_valid_segment(&t), Some(SegmentNo(2)));
    }
}
