#![forbid(unsafe_code)]
//! Victim selection for garbage collection and slot-reuse allocation.
//!
//! One entry point, [`VictimSelector::select_victim`], serves both callers:
//!
//! - **GC (LFS mode)** scans the dirty-section map with a unit of one
//!   section and scores with greedy, cost-benefit or age-threshold.
//! - **Slot reuse (SSR / AgeSsr)** scans one kind's dirty-segment map with a
//!   unit of one segment and prefers segments whose holes can be refilled.
//!
//! The age-based policies collect candidates into a transient
//! [`tree::VictimTree`] and score them after the scan.

pub mod cost;
pub mod tree;

use cost::{AtScale, CbInput, assr_score, cb_cost, cb_max_age};
use lfs_error::{LfsError, Result};
use lfs_segment::{Bitmap, DirtyClass, FreeDirtyIndex, SegmentTable, VictimCursor};
use lfs_types::{AllocMode, GcMode, GcType, SectionNo, SegKind, SegmentNo, VictimPolicy};
use serde::{Deserialize, Serialize};
use tree::VictimTree;

// ── Configuration ───────────────────────────────────────────────────────────

/// Scoring constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VictimConfig {
    /// Cap on dirty units visited by a background scan.
    ///
    /// Default: 4096.
    pub max_victim_search: u32,
    /// Cost-benefit age range when free space is plentiful.
    ///
    /// Default: 100.
    pub cb_max_age: u32,
    /// Free-space ratio (percent) below which the cost-benefit age range
    /// shrinks.
    ///
    /// Default: 10.
    pub cb_low_free_ratio: u32,
    /// Sections younger than this (seconds, relative to the youngest dirty
    /// section) are not age-threshold candidates.
    ///
    /// Default: 604800 (7 days).
    pub age_threshold: u64,
    /// Weight of age against free space in the age-threshold score.
    ///
    /// Default: 60.
    pub age_weight: u32,
    /// Percent of candidates an age-based lookup visits.
    ///
    /// Default: 20.
    pub candidate_ratio: u32,
    /// Minimum number of candidates an age-based lookup visits.
    ///
    /// Default: 10.
    pub candidate_count: u32,
    /// Fixed-point scale of the age-threshold score.
    ///
    /// Default: 10000.
    pub accuracy_class: u64,
}

impl Default for VictimConfig {
    fn default() -> Self {
        Self {
            max_victim_search: 4096,
            cb_max_age: 100,
            cb_low_free_ratio: 10,
            age_threshold: 7 * 24 * 60 * 60,
            age_weight: 60,
            candidate_ratio: 20,
            candidate_count: 10,
            accuracy_class: 10_000,
        }
    }
}

impl VictimConfig {
    pub fn validate(&self) -> Result<()> {
        if self.age_weight > 100 {
            return Err(LfsError::Config(format!(
                "age_weight {} exceeds 100",
                self.age_weight
            )));
        }
        if self.candidate_ratio > 100 {
            return Err(LfsError::Config(format!(
                "candidate_ratio {} exceeds 100",
                self.candidate_ratio
            )));
        }
        if self.accuracy_class == 0 || self.max_victim_search == 0 {
            return Err(LfsError::Config(
                "accuracy_class and max_victim_search must be non-zero".into(),
            ));
        }
        Ok(())
    }

    fn visit_budget(&self, candidates: usize) -> usize {
        let by_ratio = candidates.saturating_mul(self.candidate_ratio as usize) / 100;
        by_ratio.max(self.candidate_count as usize)
    }
}

/// Percent of reclaimable (not-live) blocks that sit in free segments.
#[must_use]
pub fn perf_ratio(free_segments: u32, blocks_per_seg: u32, main_blocks: u64, valid_blocks: u64) -> u32 {
    let reclaimable = main_blocks.saturating_sub(valid_blocks);
    if reclaimable == 0 {
        return 100;
    }
    let free = u64::from(free_segments) * u64::from(blocks_per_seg);
    u32::try_from((free * 100 / reclaimable).min(100)).unwrap_or(100)
}

// ── Requests ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VictimRequest {
    pub gc_type: GcType,
    /// Kind whose dirty map slot-reuse searches; ignored for LFS.
    pub kind: SegKind,
    pub alloc_mode: AllocMode,
    /// Query mtime for AgeSsr.
    pub age_hint: u64,
    /// Accept this segment if it still qualifies.
    pub target: Option<SegmentNo>,
    pub gc_mode: GcMode,
    /// See [`perf_ratio`].
    pub perf_ratio: u32,
}

impl VictimRequest {
    /// GC victim request.
    #[must_use]
    pub fn lfs(gc_type: GcType, gc_mode: GcMode) -> Self {
        Self {
            gc_type,
            kind: SegKind::HotData,
            alloc_mode: AllocMode::Lfs,
            age_hint: 0,
            target: None,
            gc_mode,
            perf_ratio: 100,
        }
    }

    /// Slot-reuse request for `kind`.
    #[must_use]
    pub fn ssr(kind: SegKind) -> Self {
        Self {
            gc_type: GcType::Background,
            kind,
            alloc_mode: AllocMode::Ssr,
            ..Self::lfs(GcType::Background, GcMode::Normal)
        }
    }

    /// Age-aware slot reuse near `mtime`.
    #[must_use]
    pub fn assr(kind: SegKind, mtime: u64) -> Self {
        Self {
            alloc_mode: AllocMode::AgeSsr,
            age_hint: mtime,
            ..Self::ssr(kind)
        }
    }

    #[must_use]
    pub fn with_target(mut self, target: SegmentNo) -> Self {
        self.target = Some(target);
        self
    }

    #[must_use]
    pub fn with_perf_ratio(mut self, perf_ratio: u32) -> Self {
        self.perf_ratio = perf_ratio;
        self
    }
}

/// A chosen victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Victim {
    /// Section-aligned for LFS, the segment itself for slot reuse.
    pub segno: SegmentNo,
    pub policy: VictimPolicy,
    pub cost: u64,
    /// Dirty units visited.
    pub searched: u32,
}

// ── Selection ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scoring {
    Greedy,
    CostBenefit,
    AgeThreshold,
    SlotGreedy,
    SlotAge,
}

impl Scoring {
    fn policy(self) -> VictimPolicy {
        match self {
            Self::Greedy | Self::SlotGreedy => VictimPolicy::Greedy,
            Self::CostBenefit => VictimPolicy::CostBenefit,
            Self::AgeThreshold | Self::SlotAge => VictimPolicy::AgeThreshold,
        }
    }

    fn is_age_based(self) -> bool {
        matches!(self, Self::AgeThreshold | Self::SlotAge)
    }
}

/// Lowest cost so far; equal cost goes to the larger age.
#[derive(Debug, Clone, Copy)]
struct Best {
    cost: u64,
    age: u64,
    seg: Option<SegmentNo>,
}

impl Best {
    fn new(max_cost: u64) -> Self {
        Self {
            cost: max_cost,
            age: 0,
            seg: None,
        }
    }

    fn offer(&mut self, seg: SegmentNo, cost: u64, age: u64) {
        if cost < self.cost || (self.seg.is_some() && cost == self.cost && age > self.age) {
            self.cost = cost;
            self.age = age;
            self.seg = Some(seg);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VictimSelector {
    config: VictimConfig,
}

impl VictimSelector {
    #[must_use]
    pub fn new(config: VictimConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &VictimConfig {
        &self.config
    }

    fn scoring(req: &VictimRequest) -> Scoring {
        match req.alloc_mode {
            AllocMode::Ssr => Scoring::SlotGreedy,
            AllocMode::AgeSsr => Scoring::SlotAge,
            AllocMode::Lfs => match req.gc_mode {
                GcMode::IdleCb => Scoring::CostBenefit,
                GcMode::IdleGreedy | GcMode::Urgent => Scoring::Greedy,
                GcMode::IdleAt => Scoring::AgeThreshold,
                GcMode::Normal => match req.gc_type {
                    GcType::Foreground => Scoring::Greedy,
                    GcType::Background => Scoring::AgeThreshold,
                },
            },
        }
    }

    /// Section is in use by a write head or by foreground GC.
    fn section_busy(table: &SegmentTable, index: &FreeDirtyIndex, sec: SectionNo) -> bool {
        table.is_current_section(sec) || index.cur_victim_sec() == Some(sec)
    }

    /// Choose a victim, updating scan cursors and victim markers in `index`.
    ///
    /// Runs under the arena write lock: cost-benefit widens the table's
    /// mtime bounds.
    pub fn select_victim(
        &self,
        table: &mut SegmentTable,
        index: &mut FreeDirtyIndex,
        req: &VictimRequest,
    ) -> Option<Victim> {
        let geo = *table.geometry();
        let scoring = Self::scoring(req);
        let lfs = req.alloc_mode == AllocMode::Lfs;

        if let Some(target) = req.target.filter(|t| !t.is_null() && t.0 < geo.main_segments) {
            let sec = geo.section_of(target);
            if table.valid_blocks(target) > 0 && !Self::section_busy(table, index, sec) {
                return Some(Victim {
                    segno: target,
                    policy: scoring.policy(),
                    cost: u64::from(table.valid_blocks(target)),
                    searched: 0,
                });
            }
            return None;
        }

        if lfs && req.gc_type == GcType::Foreground {
            let pending = index
                .victim_secmap()
                .iter_ones()
                .map(SectionNo)
                .find(|&sec| !Self::section_busy(&*table, index, sec) && !index.is_run_skipped(sec));
            if let Some(sec) = pending {
                index.clear_bg_victim(sec);
                index.set_cur_victim_sec(Some(sec));
                let segno = geo.first_segment(sec);
                tracing::debug!(target: "lfs::victim", %segno, "victim_from_background_pick");
                return Some(Victim {
                    segno,
                    policy: scoring.policy(),
                    cost: u64::from(table.section_valid_blocks(sec)),
                    searched: 0,
                });
            }
        }

        let mut threshold = self.config.age_threshold;
        loop {
            let outcome = self.scan(table, index, req, scoring, threshold);
            match outcome {
                ScanOutcome::Found(victim) => {
                    if lfs {
                        let sec = geo.section_of(victim.segno);
                        match req.gc_type {
                            GcType::Foreground => index.set_cur_victim_sec(Some(sec)),
                            GcType::Background => index.set_bg_victim(sec),
                        }
                    }
                    tracing::debug!(
                        target: "lfs::victim",
                        segno = %victim.segno,
                        policy = ?victim.policy,
                        cost = victim.cost,
                        searched = victim.searched,
                        gc_type = ?req.gc_type,
                        "victim_selected"
                    );
                    return Some(victim);
                }
                ScanOutcome::RetryWithoutThreshold if threshold > 0 => threshold = 0,
                ScanOutcome::RetryWithoutThreshold | ScanOutcome::Nothing => return None,
            }
        }
    }

    fn scan(
        &self,
        table: &mut SegmentTable,
        index: &mut FreeDirtyIndex,
        req: &VictimRequest,
        scoring: Scoring,
        age_threshold: u64,
    ) -> ScanOutcome {
        let geo = *table.geometry();
        let lfs = req.alloc_mode == AllocMode::Lfs;
        let unit = if lfs { geo.segs_per_sec } else { 1 };
        let dirty: Bitmap = if lfs {
            index.dirty_secmap().clone()
        } else {
            index.dirty_map(DirtyClass::Kind(req.kind)).clone()
        };
        let mut max_search = dirty.count_ones();
        if max_search == 0 {
            return ScanOutcome::Nothing;
        }
        let unclipped = req.gc_type == GcType::Foreground
            || scoring.is_age_based()
            || req.gc_mode == GcMode::Urgent;
        if !unclipped {
            max_search = max_search.min(self.config.max_victim_search);
        }

        let cursor = match scoring {
            Scoring::Greedy => VictimCursor::Greedy,
            Scoring::CostBenefit => VictimCursor::CostBenefit,
            Scoring::AgeThreshold => VictimCursor::AgeThreshold,
            Scoring::SlotGreedy | Scoring::SlotAge => VictimCursor::AllocNext,
        };
        let start_unit = (index.last_victim(cursor) / unit) % dirty.len().max(1);

        let max_cost = match scoring {
            Scoring::SlotGreedy => u64::from(geo.blocks_per_seg),
            Scoring::Greedy => 2 * u64::from(geo.blocks_per_seg) * u64::from(unit),
            // Age-based scores top out at u32::MAX; any candidate qualifies.
            _ => u64::MAX,
        };
        let mut best = Best::new(max_cost);
        let mut candidates: Vec<(SegmentNo, u64)> = Vec::new();
        let (_, max_mtime) = table.mtime_bounds();
        let max_age = cb_max_age(req.perf_ratio, self.config.cb_low_free_ratio, self.config.cb_max_age);

        let mut searched = 0_u32;
        let mut saved_cursor = 0_u32;
        let order = dirty
            .iter_ones()
            .filter(|&u| u >= start_unit)
            .chain(dirty.iter_ones().filter(|&u| u < start_unit));
        for unit_no in order {
            let segno = SegmentNo(unit_no * unit);
            searched += 1;
            let sec = geo.section_of(segno);
            let skip = Self::section_busy(table, index, sec)
                || index.is_blacklisted(sec)
                || (table.checkpoint_disabled() && table.ckpt_valid_blocks(segno) > 0)
                || (lfs && req.gc_type == GcType::Background && index.victim_secmap().get(sec.0))
                || (lfs && index.is_run_skipped(sec));
            if !skip {
                match scoring {
                    Scoring::SlotGreedy => {
                        let cost = u64::from(table.ckpt_valid_blocks(segno));
                        best.offer(segno, cost, max_mtime.saturating_sub(table.mtime(segno)));
                    }
                    Scoring::Greedy => {
                        let cost = u64::from(table.section_valid_blocks(sec));
                        let age = max_mtime.saturating_sub(table.section_mtime(sec));
                        best.offer(segno, cost, age);
                    }
                    Scoring::CostBenefit => {
                        let mtime = table.section_mtime(sec);
                        table.widen_mtime_bounds(mtime);
                        let (min, max) = table.mtime_bounds();
                        let cost = cb_cost(CbInput {
                            valid_per_seg: table.section_valid_blocks(sec) / geo.segs_per_sec,
                            blocks_per_seg: geo.blocks_per_seg,
                            mtime,
                            min_mtime: min,
                            max_mtime: max,
                            max_age,
                        });
                        best.offer(segno, cost, max.saturating_sub(mtime));
                    }
                    Scoring::AgeThreshold => {
                        candidates.push((segno, table.section_mtime(sec)));
                    }
                    Scoring::SlotAge => candidates.push((segno, table.mtime(segno))),
                }
            }
            if searched >= max_search {
                saved_cursor = (segno.0 + unit) % geo.main_segments;
                break;
            }
        }
        index.set_last_victim(cursor, saved_cursor);

        let mut spread_below_threshold = false;
        match scoring {
            Scoring::AgeThreshold => {
                spread_below_threshold = self.lookup_age_threshold(table, &candidates, age_threshold, &mut best);
            }
            Scoring::SlotAge => self.lookup_adjacent(table, &candidates, req.age_hint, &mut best),
            _ => {}
        }

        match best.seg {
            Some(seg) => {
                let segno = if lfs {
                    geo.first_segment(geo.section_of(seg))
                } else {
                    seg
                };
                ScanOutcome::Found(Victim {
                    segno,
                    policy: scoring.policy(),
                    cost: best.cost,
                    searched,
                })
            }
            None if spread_below_threshold => ScanOutcome::RetryWithoutThreshold,
            None => ScanOutcome::Nothing,
        }
    }

    /// Returns whether the dirty mtime spread is below the threshold.
    fn lookup_age_threshold(
        &self,
        table: &SegmentTable,
        candidates: &[(SegmentNo, u64)],
        age_threshold: u64,
        best: &mut Best,
    ) -> bool {
        let Some(dirty_max) = candidates.iter().map(|&(_, m)| m).max() else {
            return false;
        };
        let dirty_min = candidates.iter().map(|&(_, m)| m).min().unwrap_or(dirty_max);

        let mut tree = VictimTree::new();
        for &(seg, mtime) in candidates {
            if dirty_max - mtime >= age_threshold {
                tree.insert(mtime, seg);
            }
        }

        let geo = table.geometry();
        let sec_blocks = geo.blocks_per_sec();
        let scale = AtScale::new(dirty_min, dirty_max, self.config.accuracy_class, self.config.age_weight);
        let budget = self.config.visit_budget(tree.len());
        let mut visited = 0_usize;
        for (mtime, seg) in tree.by_age() {
            if visited >= budget {
                break;
            }
            let vblocks = u64::from(table.section_valid_blocks(geo.section_of(seg)));
            if vblocks == 0 || vblocks == sec_blocks {
                continue;
            }
            visited += 1;
            let (cost, age) = scale.score(mtime, vblocks, sec_blocks);
            best.offer(seg, cost, age);
        }
        dirty_max - dirty_min < age_threshold
    }

    fn lookup_adjacent(
        &self,
        table: &SegmentTable,
        candidates: &[(SegmentNo, u64)],
        query: u64,
        best: &mut Best,
    ) {
        let Some(dirty_max) = candidates.iter().map(|&(_, m)| m).max() else {
            return;
        };
        let mut tree = VictimTree::new();
        for &(seg, mtime) in candidates {
            tree.insert(mtime, seg);
        }
        let end_mtime = dirty_max.saturating_add(1);
        let full = table.geometry().blocks_per_seg;
        let budget = self.config.visit_budget(tree.len());

        let mut visit = |entries: &mut dyn Iterator<Item = (u64, SegmentNo)>| {
            let mut visited = 0_usize;
            for (mtime, seg) in entries {
                if visited >= budget {
                    break;
                }
                let ckpt = table.ckpt_valid_blocks(seg);
                if ckpt == 0 || ckpt == full {
                    continue;
                }
                visited += 1;
                let (cost, closeness) = assr_score(ckpt, mtime, query, end_mtime);
                best.offer(seg, cost, closeness);
            }
        };
        visit(&mut tree.older_from(query));
        visit(&mut tree.newer_than(query));
    }
}

enum ScanOutcome {
    Found(Victim),
    RetryWithoutThreshold,
    Nothing,
}
