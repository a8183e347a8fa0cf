//! Segment Metadata Table: the source of truth for per-segment validity.
//!
//! Every block transition goes through [`SegmentTable::mark_valid`] or
//! [`SegmentTable::mark_invalid`]. A transition that disagrees with the
//! recorded state is refused without mutating anything and raises the
//! volume's offline-check flag.

use crate::bitmap::Bitmap;
use crate::health::VolumeHealth;
use lfs_block::SitRecord;
use lfs_error::{LfsError, Result};
use lfs_types::{BlockAddr, FlashMode, Geometry, NR_KINDS, SectionNo, SegKind, SegmentNo, ZoneNo};
use std::sync::Arc;

/// Per-segment entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegEntry {
    pub valid_blocks: u32,
    pub ckpt_valid_blocks: u32,
    pub cur_valid_map: Bitmap,
    /// Blocks the last durable checkpoint (or a not-yet-checkpointed write)
    /// still references. Slot reuse never hands these out.
    pub ckpt_valid_map: Bitmap,
    /// Blocks known free but not yet trimmed.
    pub discard_map: Bitmap,
    pub kind: SegKind,
    pub mtime: u64,
}

impl SegEntry {
    fn new(blocks_per_seg: u32) -> Self {
        Self {
            valid_blocks: 0,
            ckpt_valid_blocks: 0,
            cur_valid_map: Bitmap::new(blocks_per_seg),
            ckpt_valid_map: Bitmap::new(blocks_per_seg),
            discard_map: Bitmap::new(blocks_per_seg),
            kind: SegKind::HotData,
            mtime: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecEntry {
    pub valid_blocks: u32,
    pub flash_mode: Option<FlashMode>,
}

#[derive(Debug)]
pub struct SegmentTable {
    geo: Geometry,
    entries: Vec<SegEntry>,
    sections: Vec<SecEntry>,
    current: [SegmentNo; NR_KINDS],
    dirty_entries: Bitmap,
    written_valid_blocks: u64,
    discard_blocks: u64,
    unusable_blocks: u64,
    min_mtime: u64,
    max_mtime: u64,
    cp_disabled: bool,
    health: Arc<VolumeHealth>,
}

impl SegmentTable {
    /// Empty table for a freshly formatted (and trimmed) main area.
    pub fn new(geo: Geometry, health: Arc<VolumeHealth>) -> Result<Self> {
        geo.validate()
            .map_err(|e| LfsError::InvalidGeometry(e.to_string()))?;
        let entries = (0..geo.main_segments)
            .map(|_| SegEntry::new(geo.blocks_per_seg))
            .collect();
        Ok(Self {
            geo,
            entries,
            sections: vec![SecEntry::default(); geo.main_sections() as usize],
            current: [SegmentNo::NULL; NR_KINDS],
            dirty_entries: Bitmap::new(geo.main_segments),
            written_valid_blocks: 0,
            discard_blocks: 0,
            unusable_blocks: 0,
            min_mtime: u64::MAX,
            max_mtime: 0,
            cp_disabled: false,
            health,
        })
    }

    /// Rebuild from persisted records. The persisted live map becomes both
    /// the live and checkpoint map; every free block is discard-eligible.
    pub fn restore(geo: Geometry, health: Arc<VolumeHealth>, records: &[SitRecord]) -> Result<Self> {
        let mut table = Self::new(geo, health)?;
        for record in records {
            let seg = record.segno;
            if seg.0 >= geo.main_segments {
                return Err(LfsError::consistency(
                    u64::from(seg.0),
                    "persisted entry beyond main area",
                ));
            }
            let map = Bitmap::from_bytes(&record.valid_map, geo.blocks_per_seg);
            let valid = map.count_ones();
            if valid != record.valid_blocks {
                return Err(LfsError::consistency(
                    geo.start_block(seg).0,
                    format!(
                        "persisted valid count {} disagrees with bitmap popcount {valid}",
                        record.valid_blocks
                    ),
                ));
            }
            let entry = &mut table.entries[seg.index()];
            entry.cur_valid_map = map.clone();
            entry.ckpt_valid_map = map;
            entry.valid_blocks = valid;
            entry.ckpt_valid_blocks = valid;
            entry.kind = record.kind;
            entry.mtime = record.mtime;
        }
        let mut written = 0_u64;
        for (idx, entry) in table.entries.iter_mut().enumerate() {
            entry.discard_map.set_all();
            for off in entry.cur_valid_map.iter_ones() {
                entry.discard_map.clear(off);
            }
            table.discard_blocks += u64::from(entry.discard_map.count_ones());
            written += u64::from(entry.valid_blocks);
            let sec = idx / geo.segs_per_sec as usize;
            table.sections[sec].valid_blocks += entry.valid_blocks;
            if entry.mtime != 0 {
                table.min_mtime = table.min_mtime.min(entry.mtime);
                table.max_mtime = table.max_mtime.max(entry.mtime);
            }
        }
        table.written_valid_blocks = written;
        Ok(table)
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    #[must_use]
    pub fn health(&self) -> &Arc<VolumeHealth> {
        &self.health
    }

    #[must_use]
    pub fn entry(&self, seg: SegmentNo) -> &SegEntry {
        &self.entries[seg.index()]
    }

    #[must_use]
    pub fn section(&self, sec: SectionNo) -> &SecEntry {
        &self.sections[sec.index()]
    }

    #[must_use]
    pub fn valid_blocks(&self, seg: SegmentNo) -> u32 {
        self.entries[seg.index()].valid_blocks
    }

    #[must_use]
    pub fn ckpt_valid_blocks(&self, seg: SegmentNo) -> u32 {
        self.entries[seg.index()].ckpt_valid_blocks
    }

    #[must_use]
    pub fn section_valid_blocks(&self, sec: SectionNo) -> u32 {
        self.sections[sec.index()].valid_blocks
    }

    #[must_use]
    pub fn kind(&self, seg: SegmentNo) -> SegKind {
        self.entries[seg.index()].kind
    }

    pub fn set_kind(&mut self, seg: SegmentNo, kind: SegKind) {
        let entry = &mut self.entries[seg.index()];
        if entry.kind != kind {
            entry.kind = kind;
            self.dirty_entries.set(seg.0);
        }
    }

    #[must_use]
    pub fn mtime(&self, seg: SegmentNo) -> u64 {
        self.entries[seg.index()].mtime
    }

    /// Mtime of the last segment in `sec` that still holds valid blocks.
    #[must_use]
    pub fn section_mtime(&self, sec: SectionNo) -> u64 {
        let first = self.geo.first_segment(sec).0;
        (first..first + self.geo.segs_per_sec)
            .rev()
            .map(|s| &self.entries[s as usize])
            .find(|e| e.valid_blocks > 0)
            .map_or(0, |e| e.mtime)
    }

    /// Live-block percentage of `seg`.
    #[must_use]
    pub fn utilization(&self, seg: SegmentNo) -> u32 {
        self.valid_blocks(seg) * 100 / self.geo.blocks_per_seg
    }

    #[must_use]
    pub fn segment_of(&self, addr: BlockAddr) -> Option<SegmentNo> {
        self.geo.segment_of(addr)
    }

    #[must_use]
    pub fn is_valid(&self, addr: BlockAddr) -> bool {
        self.geo
            .segment_of(addr)
            .is_some_and(|seg| self.entries[seg.index()].cur_valid_map.get(self.geo.block_offset(addr)))
    }

    #[must_use]
    pub fn section_flash_mode(&self, sec: SectionNo) -> Option<FlashMode> {
        self.sections[sec.index()].flash_mode
    }

    pub fn set_section_flash_mode(&mut self, sec: SectionNo, mode: Option<FlashMode>) {
        self.sections[sec.index()].flash_mode = mode;
    }

    // ── Write heads ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn current(&self, kind: SegKind) -> SegmentNo {
        self.current[kind.index()]
    }

    pub fn set_current(&mut self, kind: SegKind, seg: SegmentNo) {
        self.current[kind.index()] = seg;
    }

    #[must_use]
    pub fn is_current_segment(&self, seg: SegmentNo) -> bool {
        self.current.contains(&seg)
    }

    #[must_use]
    pub fn is_current_section(&self, sec: SectionNo) -> bool {
        self.current
            .iter()
            .any(|&seg| !seg.is_null() && self.geo.section_of(seg) == sec)
    }

    /// Zones hosting a write head other than `except`.
    #[must_use]
    pub fn current_zones(&self, except: SegKind) -> Vec<ZoneNo> {
        SegKind::ALL
            .iter()
            .filter(|&&k| k != except)
            .map(|&k| self.current[k.index()])
            .filter(|seg| !seg.is_null())
            .map(|seg| self.geo.zone_of(self.geo.section_of(seg)))
            .collect()
    }

    // ── Block transitions ───────────────────────────────────────────────────

    fn locate(&self, addr: BlockAddr) -> Result<(SegmentNo, u32)> {
        match self.geo.segment_of(addr) {
            Some(seg) => Ok((seg, self.geo.block_offset(addr))),
            None => Err(self.violation(addr, "address outside main area")),
        }
    }

    fn violation(&self, addr: BlockAddr, detail: &str) -> LfsError {
        self.health.flag(addr.0, detail);
        LfsError::consistency(addr.0, detail)
    }

    /// Mark `addr` live.
    ///
    /// `inherited` carries the source segment's mtime for relocated blocks;
    /// fresh writes are stamped with `now`.
    pub fn mark_valid(&mut self, addr: BlockAddr, now: u64, inherited: Option<u64>) -> Result<SegmentNo> {
        let (seg, off) = self.locate(addr)?;
        let full = self.geo.blocks_per_seg;
        let entry = &self.entries[seg.index()];
        if entry.cur_valid_map.get(off) {
            return Err(self.violation(addr, "block already valid"));
        }
        if entry.valid_blocks >= full {
            return Err(self.violation(addr, "valid count would exceed segment size"));
        }

        self.update_mtime(seg, inherited.unwrap_or(now), now, false);
        let cp_disabled = self.cp_disabled;
        let entry = &mut self.entries[seg.index()];
        entry.cur_valid_map.set(off);
        entry.valid_blocks += 1;
        if entry.discard_map.test_and_clear(off) {
            self.discard_blocks -= 1;
        }
        if !cp_disabled && !entry.ckpt_valid_map.test_and_set(off) {
            entry.ckpt_valid_blocks += 1;
        }
        self.sections[self.geo.section_of(seg).index()].valid_blocks += 1;
        self.written_valid_blocks += 1;
        self.dirty_entries.set(seg.0);
        Ok(seg)
    }

    /// Mark `addr` dead. The checkpoint bitmap is left untouched.
    pub fn mark_invalid(&mut self, addr: BlockAddr, now: u64) -> Result<SegmentNo> {
        let (seg, off) = self.locate(addr)?;
        if !self.entries[seg.index()].cur_valid_map.get(off) {
            return Err(self.violation(addr, "block already invalid"));
        }

        self.update_mtime(seg, now, now, true);
        let cp_disabled = self.cp_disabled;
        let entry = &mut self.entries[seg.index()];
        entry.cur_valid_map.clear(off);
        entry.valid_blocks -= 1;
        if !entry.discard_map.test_and_set(off) {
            self.discard_blocks += 1;
        }
        if cp_disabled && entry.ckpt_valid_map.get(off) {
            self.unusable_blocks += 1;
        }
        self.sections[self.geo.section_of(seg).index()].valid_blocks -= 1;
        self.written_valid_blocks -= 1;
        self.dirty_entries.set(seg.0);
        Ok(seg)
    }

    /// Running weighted average of write times. Must run before the count
    /// changes: the weight is the number of blocks the old mtime stands for.
    fn update_mtime(&mut self, seg: SegmentNo, mtime: u64, now: u64, removing: bool) {
        let entry = &mut self.entries[seg.index()];
        if entry.mtime == 0 {
            entry.mtime = mtime;
        } else {
            let weight = if removing {
                u64::from(entry.valid_blocks.saturating_sub(1))
            } else {
                u64::from(entry.valid_blocks)
            };
            let total = u128::from(entry.mtime) * u128::from(weight) + u128::from(mtime);
            entry.mtime = u64::try_from(total / (u128::from(weight) + 1)).unwrap_or(u64::MAX);
        }
        self.min_mtime = self.min_mtime.min(entry.mtime);
        self.max_mtime = self.max_mtime.max(now);
    }

    /// First block in `seg` at or after `from` that neither the live nor the
    /// checkpoint bitmap references.
    #[must_use]
    pub fn next_reusable_block(&self, seg: SegmentNo, from: u32) -> Option<u32> {
        let entry = &self.entries[seg.index()];
        (from..self.geo.blocks_per_seg)
            .find(|&off| !entry.cur_valid_map.get(off) && !entry.ckpt_valid_map.get(off))
    }

    // ── Mtime bounds ────────────────────────────────────────────────────────

    #[must_use]
    pub fn mtime_bounds(&self) -> (u64, u64) {
        (self.min_mtime, self.max_mtime)
    }

    /// Widen the bounds to include `mtime`.
    pub fn widen_mtime_bounds(&mut self, mtime: u64) {
        self.min_mtime = self.min_mtime.min(mtime);
        self.max_mtime = self.max_mtime.max(mtime);
    }

    // ── Checkpoint support ──────────────────────────────────────────────────

    #[must_use]
    pub fn checkpoint_disabled(&self) -> bool {
        self.cp_disabled
    }

    pub fn set_checkpoint_disabled(&mut self, disabled: bool) {
        self.cp_disabled = disabled;
        if !disabled {
            self.unusable_blocks = 0;
        }
    }

    #[must_use]
    pub fn dirty_entry_count(&self) -> u32 {
        self.dirty_entries.count_ones()
    }

    /// Entries changed since the last checkpoint.
    pub fn dirty_segments(&self) -> impl Iterator<Item = SegmentNo> + '_ {
        self.dirty_entries.iter_ones().map(SegmentNo)
    }

    /// Journal records for every dirty entry.
    #[must_use]
    pub fn dirty_records(&self) -> Vec<SitRecord> {
        self.dirty_segments()
            .map(|seg| {
                let entry = &self.entries[seg.index()];
                SitRecord {
                    segno: seg,
                    kind: entry.kind,
                    valid_blocks: entry.valid_blocks,
                    mtime: entry.mtime,
                    valid_map: entry.cur_valid_map.as_bytes().to_vec(),
                }
            })
            .collect()
    }

    /// Make the live state of every dirty entry the new checkpoint state.
    pub fn commit_dirty_entries(&mut self) -> u32 {
        let dirty: Vec<SegmentNo> = self.dirty_segments().collect();
        for seg in &dirty {
            let entry = &mut self.entries[seg.index()];
            entry.ckpt_valid_map.copy_from(&entry.cur_valid_map);
            entry.ckpt_valid_blocks = entry.valid_blocks;
        }
        self.dirty_entries.clear_all();
        self.unusable_blocks = 0;
        dirty.len() as u32
    }

    /// Blocks invalidated since the last checkpoint, as runs within `seg`.
    ///
    /// With `force`, instead returns blocks free at the last checkpoint that
    /// are still untrimmed, dropping interior runs shorter than `minlen`.
    #[must_use]
    pub fn discard_candidates(&self, seg: SegmentNo, force: bool, minlen: u32) -> Vec<(u32, u32)> {
        let entry = &self.entries[seg.index()];
        let mut map = Bitmap::new(self.geo.blocks_per_seg);
        for off in 0..self.geo.blocks_per_seg {
            let ckpt = entry.ckpt_valid_map.get(off);
            let eligible = if force {
                !ckpt && entry.discard_map.get(off)
            } else {
                ckpt && !entry.cur_valid_map.get(off)
            };
            if eligible {
                map.set(off);
            }
        }
        map.runs()
            .filter(|&(start, len)| {
                !force
                    || len >= minlen
                    || start == 0
                    || start + len == self.geo.blocks_per_seg
            })
            .collect()
    }

    /// Record that `[start, start+len)` of `seg` has been queued for TRIM.
    pub fn mark_discard_queued(&mut self, seg: SegmentNo, start: u32, len: u32) {
        let cleared = self.entries[seg.index()]
            .discard_map
            .clear_range(start, start + len);
        self.discard_blocks -= u64::from(cleared);
    }

    // ── Accounting ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn written_valid_blocks(&self) -> u64 {
        self.written_valid_blocks
    }

    #[must_use]
    pub fn discard_blocks(&self) -> u64 {
        self.discard_blocks
    }

    #[must_use]
    pub fn unusable_blocks(&self) -> u64 {
        self.unusable_blocks
    }

    /// Check every table invariant. Used by tests and the `verify` path.
    pub fn verify(&self) -> Result<()> {
        let mut written = 0_u64;
        let mut discard = 0_u64;
        let mut sec_valid = vec![0_u32; self.sections.len()];
        for (idx, entry) in self.entries.iter().enumerate() {
            let block = self.geo.start_block(SegmentNo(idx as u32)).0;
            if entry.valid_blocks != entry.cur_valid_map.count_ones() {
                return Err(LfsError::consistency(block, "valid count != live popcount"));
            }
            if entry.ckpt_valid_blocks != entry.ckpt_valid_map.count_ones() {
                return Err(LfsError::consistency(block, "ckpt count != ckpt popcount"));
            }
            if entry.valid_blocks > self.geo.blocks_per_seg {
                return Err(LfsError::consistency(block, "valid count above segment size"));
            }
            written += u64::from(entry.valid_blocks);
            discard += u64::from(entry.discard_map.count_ones());
            sec_valid[idx / self.geo.segs_per_sec as usize] += entry.valid_blocks;
        }
        if written != self.written_valid_blocks {
            return Err(LfsError::consistency(0, "written_valid_blocks drifted"));
        }
        if discard != self.discard_blocks {
            return Err(LfsError::consistency(0, "discard_blocks drifted"));
        }
        for (idx, sec) in self.sections.iter().enumerate() {
            if sec.valid_blocks != sec_valid[idx] {
                return Err(LfsError::consistency(0, format!("section {idx} valid count drifted")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ConsistencyPolicy;
    use proptest::prelude::*;

    fn geo() -> Geometry {
        Geometry {
            blocks_per_seg: 16,
            segs_per_sec: 2,
            secs_per_zone: 1,
            main_blkaddr: 64,
            main_segments: 8,
            reserved_segments: 2,
            overprov_segments: 2,
            slc_segs_per_sec: 0,
        }
    }

    fn table() -> SegmentTable {
        SegmentTable::new(geo(), Arc::new(VolumeHealth::new(ConsistencyPolicy::Halt)))
            .expect("table")
    }

    fn addr(seg: u32, off: u64) -> BlockAddr {
        BlockAddr(64 + u64::from(seg) * 16 + off)
    }

    // ── Transitions ─────────────────────────────────────────────────────

    #[test]
    fn mark_valid_then_invalid_round_trips_counts() {
        let mut t = table();
        t.mark_valid(addr(1, 3), 100, None).expect("valid");
        assert_eq!(t.valid_blocks(SegmentNo(1)), 1);
        assert_eq!(t.ckpt_valid_blocks(SegmentNo(1)), 1);
        assert_eq!(t.section_valid_blocks(SectionNo(0)), 1);
        assert_eq!(t.written_valid_blocks(), 1);

        t.mark_invalid(addr(1, 3), 101).expect("invalid");
        assert_eq!(t.valid_blocks(SegmentNo(1)), 0);
        assert_eq!(t.ckpt_valid_blocks(SegmentNo(1)), 1, "ckpt map untouched");
        assert_eq!(t.written_valid_blocks(), 0);
        assert_eq!(t.discard_blocks(), 1);
        t.verify().expect("verify");
    }

    #[test]
    fn double_set_is_refused_without_mutation() {
        let mut t = table();
        t.mark_valid(addr(0, 0), 1, None).expect("valid");
        let before = t.entry(SegmentNo(0)).clone();
        let err = t.mark_valid(addr(0, 0), 2, None).expect_err("double set");
        assert!(matches!(err, LfsError::ConsistencyViolation { .. }));
        assert_eq!(t.entry(SegmentNo(0)), &before);
        assert!(t.health().need_fsck());
    }

    #[test]
    fn double_clear_and_out_of_range_are_violations() {
        let mut t = table();
        assert!(t.mark_invalid(addr(2, 5), 1).is_err());
        assert!(t.mark_valid(BlockAddr(10), 1, None).is_err());
        assert!(t.mark_valid(addr(8, 0), 1, None).is_err());
        assert_eq!(t.health().violations(), 3);
        t.verify().expect("verify");
    }

    #[test]
    fn checkpoint_disabled_leaves_ckpt_map_and_counts_unusable() {
        let mut t = table();
        t.mark_valid(addr(0, 1), 1, None).expect("valid");
        t.commit_dirty_entries();
        t.set_checkpoint_disabled(true);
        t.mark_valid(addr(0, 2), 2, None).expect("valid");
        assert_eq!(t.ckpt_valid_blocks(SegmentNo(0)), 1);
        t.mark_invalid(addr(0, 1), 3).expect("invalid");
        assert_eq!(t.unusable_blocks(), 1);
        t.set_checkpoint_disabled(false);
        assert_eq!(t.unusable_blocks(), 0);
    }

    // ── Mtime ───────────────────────────────────────────────────────────

    #[test]
    fn mtime_is_weighted_average() {
        let mut t = table();
        t.mark_valid(addr(3, 0), 100, None).expect("valid");
        assert_eq!(t.mtime(SegmentNo(3)), 100);
        t.mark_valid(addr(3, 1), 200, None).expect("valid");
        assert_eq!(t.mtime(SegmentNo(3)), 150);
        t.mark_valid(addr(3, 2), 300, Some(30)).expect("relocated");
        assert_eq!(t.mtime(SegmentNo(3)), (150 * 2 + 30) / 3);
        assert_eq!(t.mtime_bounds().1, 300);
    }

    #[test]
    fn section_mtime_uses_last_segment_with_data() {
        let mut t = table();
        t.mark_valid(addr(2, 0), 50, None).expect("valid");
        t.mark_valid(addr(3, 0), 70, None).expect("valid");
        assert_eq!(t.section_mtime(SectionNo(1)), 70);
        t.mark_invalid(addr(3, 0), 70).expect("invalid");
        assert_eq!(t.section_mtime(SectionNo(1)), 50);
    }

    // ── Checkpoint ──────────────────────────────────────────────────────

    #[test]
    fn commit_copies_live_to_checkpoint_and_clears_journal() {
        let mut t = table();
        t.mark_valid(addr(4, 0), 1, None).expect("valid");
        t.mark_valid(addr(4, 1), 1, None).expect("valid");
        t.mark_invalid(addr(4, 0), 2).expect("invalid");
        let records = t.dirty_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].valid_blocks, 1);
        assert_eq!(t.ckpt_valid_blocks(SegmentNo(4)), 2);
        assert_eq!(t.commit_dirty_entries(), 1);
        assert_eq!(t.ckpt_valid_blocks(SegmentNo(4)), 1);
        assert_eq!(t.dirty_entry_count(), 0);
    }

    #[test]
    fn reusable_blocks_skip_checkpointed_slots() {
        let mut t = table();
        for off in 0..4 {
            t.mark_valid(addr(5, off), 1, None).expect("valid");
        }
        t.mark_invalid(addr(5, 1), 2).expect("invalid");
        assert_eq!(t.next_reusable_block(SegmentNo(5), 0), Some(4));
        t.commit_dirty_entries();
        assert_eq!(t.next_reusable_block(SegmentNo(5), 0), Some(1));
    }

    #[test]
    fn discard_candidates_normal_and_forced() {
        let mut t = table();
        for off in 0..6 {
            t.mark_valid(addr(6, off), 1, None).expect("valid");
        }
        t.commit_dirty_entries();
        t.mark_invalid(addr(6, 1), 2).expect("invalid");
        t.mark_invalid(addr(6, 2), 2).expect("invalid");
        t.mark_invalid(addr(6, 4), 2).expect("invalid");
        assert_eq!(
            t.discard_candidates(SegmentNo(6), false, 1),
            vec![(1, 2), (4, 1)]
        );
        t.commit_dirty_entries();
        assert_eq!(
            t.discard_candidates(SegmentNo(6), true, 2),
            vec![(1, 2)],
            "interior run shorter than minlen dropped"
        );
        t.mark_discard_queued(SegmentNo(6), 1, 2);
        assert_eq!(t.discard_blocks(), 1);
        assert!(t.discard_candidates(SegmentNo(6), true, 1) == vec![(4, 1)]);
    }

    #[test]
    fn restore_rebuilds_counts_and_rejects_mismatch() {
        let health = Arc::new(VolumeHealth::new(ConsistencyPolicy::Halt));
        let good = SitRecord {
            segno: SegmentNo(2),
            kind: SegKind::ColdData,
            valid_blocks: 3,
            mtime: 42,
            valid_map: vec![0b0000_0111, 0],
        };
        let t = SegmentTable::restore(geo(), Arc::clone(&health), &[good.clone()]).expect("restore");
        assert_eq!(t.valid_blocks(SegmentNo(2)), 3);
        assert_eq!(t.ckpt_valid_blocks(SegmentNo(2)), 3);
        assert_eq!(t.kind(SegmentNo(2)), SegKind::ColdData);
        assert_eq!(t.section_valid_blocks(SectionNo(1)), 3);
        assert_eq!(t.discard_blocks(), 8 * 16 - 3);
        t.verify().expect("verify");

        let bad = SitRecord {
            valid_blocks: 4,
            ..good
        };
        assert!(SegmentTable::restore(geo(), health, &[bad]).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn popcount_invariant_survives_random_transitions(
            ops in proptest::collection::vec((0_u32..8, 0_u64..16, any::<bool>()), 1..300)
        ) {
            let mut t = table();
            for (seg, off, set) in ops {
                let a = addr(seg, off);
                let _ = if set { t.mark_valid(a, 10, None) } else { t.mark_invalid(a, 10) };
                let e = t.entry(SegmentNo(seg));
                prop_assert_eq!(e.valid_blocks, e.cur_valid_map.count_ones());
            }
            prop_assert!(t.verify().is_ok());
        }
    }
}
