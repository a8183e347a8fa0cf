//! Collection runs.
//!
//! [`GcManager::run`] holds the GC lock for the whole run and collects one
//! segment per pass until its stop condition holds:
//!
//! - **sync**: a section was freed (then checkpoint), or no victim is left;
//! - **background**: one pass, unless free sections are short, in which
//!   case it turns foreground and keeps going;
//! - **foreground, not sync**: until free sections are back above the
//!   checkpoint headroom.
//!
//! A multi-segment section is collected over consecutive passes: after a
//! segment the next one in the same section becomes the next victim.
//!
//! Blocks freed since the last checkpoint cannot take relocated data. When
//! a pass runs out of targets the run checkpoints once and retries the
//! same victim.

use crate::relocate::Relocator;
use crate::scheduler::{PressureSnapshot, WakeReason};
use crate::GcConfig;
use lfs_alloc::SegmentAllocator;
use lfs_block::{
    BlockDevice, CheckpointReason, IoMonitor, MetaStore, ReferenceResolver, RelocationOffload,
    WakeSignal,
};
use lfs_checkpoint::CheckpointPipeline;
use lfs_error::{LfsError, Result};
use lfs_segment::{Mutation, VictimCursor, is_fragmented};
use lfs_types::{AllocMode, BlockAddr, GcType, SectionNo, SegKind, SegmentNo, VictimPolicy};
use lfs_victim::{VictimRequest, VictimSelector, perf_ratio};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// What the collector needs from the layers around it.
pub struct GcCollaborators {
    pub meta: Arc<dyn MetaStore>,
    pub resolver: Arc<dyn ReferenceResolver>,
    /// Used for the software copy.
    pub device: Arc<dyn BlockDevice>,
    pub offload: Option<Arc<dyn RelocationOffload>>,
    pub monitor: Arc<IoMonitor>,
}

/// Result of one [`GcManager::run`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GcOutcome {
    pub passes: u32,
    /// Segments collected, in pass order.
    pub victims: Vec<SegmentNo>,
    pub sections_freed: u32,
    pub blocks_moved: u64,
    /// Live-mapped blocks nobody referenced any more.
    pub blocks_dropped: u64,
    pub relocation_failures: u32,
    pub checkpoints: u32,
    /// The run stopped because selection found nothing.
    pub no_victim: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcStats {
    pub runs: u64,
    pub fg_passes: u64,
    pub bg_passes: u64,
    pub sections_freed: u64,
    pub blocks_moved: u64,
    pub blocks_dropped: u64,
    pub relocation_failures: u64,
    pub blacklisted: u64,
    pub stuck_sections: u64,
    pub no_victim: u64,
    pub checkpoints: u64,
}

#[derive(Debug, Default)]
struct Counters {
    runs: AtomicU64,
    fg_passes: AtomicU64,
    bg_passes: AtomicU64,
    sections_freed: AtomicU64,
    blocks_moved: AtomicU64,
    blocks_dropped: AtomicU64,
    relocation_failures: AtomicU64,
    blacklisted: AtomicU64,
    stuck_sections: AtomicU64,
    no_victim: AtomicU64,
    checkpoints: AtomicU64,
}

/// Foreground passes that freed nothing on one section.
#[derive(Debug, Clone, Copy)]
struct StuckVictim {
    section: SectionNo,
    passes: u32,
}

/// Everything behind the GC lock.
#[derive(Debug, Default)]
struct GcState {
    next_victim: Option<(SegmentNo, VictimPolicy)>,
    stuck: Option<StuckVictim>,
    /// Sections given up on since mount.
    stuck_sections: u32,
    retries: HashMap<SegmentNo, u32>,
}

#[derive(Debug, Clone, Copy, Default)]
struct SegmentReport {
    moved: u64,
    dropped: u64,
    segment_empty: bool,
    section_empty: bool,
}

pub struct GcManager {
    alloc: Arc<SegmentAllocator>,
    checkpoint: Arc<CheckpointPipeline>,
    selector: VictimSelector,
    collab: GcCollaborators,
    config: GcConfig,
    /// The GC lock. Outermost in the lock order.
    state: Mutex<GcState>,
    signal: WakeSignal<WakeReason>,
    /// Set by [`GcManager::cancel`]; non-sync runs stop at the next pass.
    cancelled: AtomicBool,
    counters: Counters,
}

impl fmt::Debug for GcManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcManager")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl GcManager {
    #[must_use]
    pub fn new(
        alloc: Arc<SegmentAllocator>,
        checkpoint: Arc<CheckpointPipeline>,
        selector: VictimSelector,
        collab: GcCollaborators,
        config: GcConfig,
    ) -> Self {
        Self {
            alloc,
            checkpoint,
            selector,
            collab,
            config,
            state: Mutex::new(GcState::default()),
            signal: WakeSignal::new(),
            cancelled: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    #[must_use]
    pub fn signal(&self) -> &WakeSignal<WakeReason> {
        &self.signal
    }

    pub fn wake(&self, reason: WakeReason) {
        self.signal.notify(reason);
    }

    /// Stop non-sync runs between passes and wake the worker to exit. A
    /// relocation already started still completes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.wake(WakeReason::ShutdownRequested);
    }

    /// Accept non-sync runs again after [`cancel`](Self::cancel).
    pub fn resume(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Segment the next pass will continue with, if any.
    #[must_use]
    pub fn pending_victim(&self) -> Option<SegmentNo> {
        self.state.lock().next_victim.map(|(seg, _)| seg)
    }

    #[must_use]
    pub fn pressure(&self) -> PressureSnapshot {
        let geo = *self.alloc.arena().geometry();
        let tuning = self.alloc.tuning();
        let usage = self.alloc.arena().usage();
        let free = usage.free_sections;
        let not_enough_free =
            tuning
                .levels
                .has_not_enough_free_secs(free, 0, 0, tuning.dirty_meta);
        let fragmented = is_fragmented(usage.free_blocks, free, geo.blocks_per_sec());
        PressureSnapshot {
            free_sections: free,
            prefree_sections: usage.prefree_sections,
            level: tuning.levels.pressure_level(free, not_enough_free),
            not_enough_free,
            fragmented,
            policy: tuning.levels.band_policy(free, fragmented),
            gc_mode: tuning.gc_mode,
            device_idle: self
                .collab
                .monitor
                .is_idle(Duration::from_millis(self.config.idle_interval_ms)),
        }
    }

    /// Run garbage collection.
    ///
    /// `sync` callers block until a section is freed; `NoSpace` means no
    /// victim is left, or the pass limit was hit, and free sections are
    /// still short. `background` allows a background-type pass; without it
    /// a non-sync run does nothing unless free sections are short. `target`
    /// is tried as the first victim.
    ///
    /// A non-sync run whose first selection finds nothing returns
    /// `NoVictim`, and one stopped by [`cancel`](Self::cancel) returns
    /// `Cancelled`.
    pub fn run(&self, sync: bool, background: bool, target: Option<SegmentNo>) -> Result<GcOutcome> {
        let mut state = self.state.lock();
        self.counters.runs.fetch_add(1, Ordering::Relaxed);
        let mut outcome = GcOutcome::default();
        let result = self.run_locked(&mut state, &mut outcome, sync, background, target);
        self.finish_run(&mut state);
        drop(state);

        tracing::debug!(
            target: "lfs::gc",
            sync,
            passes = outcome.passes,
            sections_freed = outcome.sections_freed,
            blocks_moved = outcome.blocks_moved,
            blocks_dropped = outcome.blocks_dropped,
            no_victim = outcome.no_victim,
            ok = result.is_ok(),
            "gc_run_finished"
        );
        result.map(|()| outcome)
    }

    fn run_locked(
        &self,
        state: &mut GcState,
        outcome: &mut GcOutcome,
        sync: bool,
        background: bool,
        mut target: Option<SegmentNo>,
    ) -> Result<()> {
        let arena = Arc::clone(self.alloc.arena());
        let geo = *arena.geometry();
        let mut sec_freed = 0_u32;
        let mut space_checkpointed = false;

        loop {
            arena.health().check(Mutation::Reclaim)?;
            if !sync && self.is_cancelled() {
                tracing::debug!(target: "lfs::gc", passes = outcome.passes, "gc_run_cancelled");
                return Err(LfsError::Cancelled);
            }
            if outcome.passes >= self.config.max_passes {
                tracing::warn!(target: "lfs::gc", passes = outcome.passes, sync, "gc_pass_limit_reached");
                return if sync { Err(LfsError::NoSpace) } else { Ok(()) };
            }

            let mut gc_type = if sync {
                GcType::Foreground
            } else {
                GcType::Background
            };
            if gc_type == GcType::Background && self.not_enough_free(0) {
                self.checkpoint_if_prefree(outcome)?;
                if self.not_enough_free(0) {
                    gc_type = GcType::Foreground;
                }
            }
            if gc_type == GcType::Background && !background {
                return Ok(());
            }
            let pressure = self.pressure();
            if pressure.policy.greedy {
                gc_type = GcType::Foreground;
            }

            let Some((segno, policy)) = self.pick_victim(state, gc_type, target.take()) else {
                outcome.no_victim = true;
                self.counters.no_victim.fetch_add(1, Ordering::Relaxed);
                if sync {
                    self.checkpoint_if_prefree(outcome)?;
                    if self.not_enough_free(0) {
                        return Err(LfsError::NoSpace);
                    }
                } else if outcome.passes == 0 {
                    return Err(LfsError::NoVictim);
                }
                return Ok(());
            };
            if pressure.policy.iolimit > 0 {
                gc_type = GcType::Foreground;
            }

            let sec = geo.section_of(segno);
            if state.stuck.is_some_and(|stuck| stuck.section != sec) {
                state.stuck = None;
            }
            outcome.passes += 1;
            outcome.victims.push(segno);
            match gc_type {
                GcType::Foreground => self.counters.fg_passes.fetch_add(1, Ordering::Relaxed),
                GcType::Background => self.counters.bg_passes.fetch_add(1, Ordering::Relaxed),
            };

            let report = match self.collect(segno, gc_type, policy) {
                Ok(report) => {
                    state.retries.remove(&segno);
                    let next = SegmentNo(segno.0 + 1);
                    state.next_victim = if report.section_empty || next.0 % geo.segs_per_sec == 0 {
                        None
                    } else {
                        Some((next, policy))
                    };
                    report
                }
                Err(LfsError::RelocationFailed { detail, .. }) => {
                    outcome.relocation_failures += 1;
                    self.relocation_failed(state, segno, policy, &detail);
                    SegmentReport::default()
                }
                Err(LfsError::NoSpace) if !space_checkpointed && self.checkpoint_enabled() => {
                    space_checkpointed = true;
                    tracing::debug!(
                        target: "lfs::gc",
                        segno = segno.0,
                        "gc_targets_exhausted_checkpointing"
                    );
                    self.write_checkpoint(outcome)?;
                    outcome.passes -= 1;
                    outcome.victims.pop();
                    state.next_victim = Some((segno, policy));
                    continue;
                }
                Err(err) => return Err(err),
            };
            outcome.blocks_moved += report.moved;
            outcome.blocks_dropped += report.dropped;
            self.counters.blocks_moved.fetch_add(report.moved, Ordering::Relaxed);
            self.counters.blocks_dropped.fetch_add(report.dropped, Ordering::Relaxed);

            if report.section_empty {
                sec_freed += 1;
                outcome.sections_freed += 1;
                self.counters.sections_freed.fetch_add(1, Ordering::Relaxed);
                state.stuck = None;
            } else if gc_type == GcType::Foreground && !report.segment_empty {
                self.note_stuck(state, sec);
            }

            if sync {
                if sec_freed > 0 {
                    self.write_checkpoint(outcome)?;
                    return Ok(());
                }
                continue;
            }

            let levels = self.alloc.tuning().levels;
            let after = self.pressure();
            if after.prefree_sections > self.config.prefree_sec_threshold
                && after.free_sections < levels.l3
            {
                self.write_checkpoint(outcome)?;
            }
            if self.not_enough_free(sec_freed) {
                if self.checkpoint_if_prefree(outcome)? {
                    sec_freed = 0;
                    if !self.not_enough_free(0) {
                        return Ok(());
                    }
                }
                continue;
            }
            if gc_type == GcType::Foreground && sec_freed > 0 {
                self.checkpoint_if_prefree(outcome)?;
            }
            return Ok(());
        }
    }

    fn pick_victim(
        &self,
        state: &mut GcState,
        gc_type: GcType,
        target: Option<SegmentNo>,
    ) -> Option<(SegmentNo, VictimPolicy)> {
        let arena = self.alloc.arena();
        let geo = *arena.geometry();
        if let Some((segno, policy)) = state.next_victim.take() {
            let blocked = arena.read(|_, index| index.is_blacklisted(geo.section_of(segno)));
            if !blocked {
                return Some((segno, policy));
            }
        }

        let tuning = self.alloc.tuning();
        let usage = arena.usage();
        let ratio = perf_ratio(
            usage.free_segments,
            geo.blocks_per_seg,
            geo.main_blocks(),
            usage.valid_blocks,
        );
        let mut request = VictimRequest::lfs(gc_type, tuning.gc_mode).with_perf_ratio(ratio);
        if let Some(target) = target {
            request = request.with_target(target);
        }
        arena
            .write(|table, index| self.selector.select_victim(table, index, &request))
            .map(|victim| (victim.segno, victim.policy))
    }

    /// Collect one segment. The section is marked as the current victim
    /// while its blocks move, so no head lands in it.
    fn collect(&self, segno: SegmentNo, gc_type: GcType, policy: VictimPolicy) -> Result<SegmentReport> {
        let arena = self.alloc.arena();
        let sec = arena.geometry().section_of(segno);
        arena.write(|_, index| index.set_cur_victim_sec(Some(sec)));
        let result = self.collect_segment(segno, gc_type, policy);
        arena.write(|_, index| index.set_cur_victim_sec(None));
        result
    }

    fn collect_segment(
        &self,
        segno: SegmentNo,
        gc_type: GcType,
        policy: VictimPolicy,
    ) -> Result<SegmentReport> {
        let arena = self.alloc.arena();
        let geo = *arena.geometry();
        let sec = geo.section_of(segno);
        let start = geo.start_block(segno);

        let (kind, live) = arena.read(|table, _| {
            let live: Vec<BlockAddr> = (0..u64::from(geo.blocks_per_seg))
                .map(|off| BlockAddr(start.0 + off))
                .filter(|&addr| table.is_valid(addr))
                .collect();
            (table.kind(segno), live)
        });

        let (dest, mode) = if kind.is_data() && policy == VictimPolicy::AgeThreshold {
            (SegKind::Fragment, AllocMode::AgeSsr)
        } else {
            (kind.cold_of_class(), AllocMode::Lfs)
        };
        let mut report = SegmentReport::default();
        if !live.is_empty() {
            if let Some(summary) = self.collab.meta.read_summary(segno)? {
                if summary.kind.is_data() != kind.is_data() {
                    return Err(self.summary_mismatch(segno, sec, summary.kind, kind));
                }
            }

            let mut owned = Vec::with_capacity(live.len());
            for addr in live {
                if gc_type == GcType::Background && self.not_enough_free(0) {
                    tracing::debug!(target: "lfs::gc", %segno, "gc_background_pass_cut_short");
                    break;
                }
                match self.collab.resolver.owner_of(addr) {
                    Some(owner) => owned.push((owner, addr)),
                    None => {
                        self.alloc.invalidate_block(addr)?;
                        report.dropped += 1;
                    }
                }
            }

            let relocator = Relocator {
                alloc: &self.alloc,
                resolver: self.collab.resolver.as_ref(),
                device: self.collab.device.as_ref(),
                offload: self.collab.offload.as_deref(),
            };
            report.moved = relocator.relocate(segno, dest, mode, &owned)?;
        }

        let (seg_valid, sec_valid) =
            arena.read(|table, _| (table.valid_blocks(segno), table.section_valid_blocks(sec)));
        report.segment_empty = seg_valid == 0;
        report.section_empty = sec_valid == 0;
        tracing::debug!(
            target: "lfs::gc",
            %segno,
            ?gc_type,
            ?policy,
            %dest,
            moved = report.moved,
            dropped = report.dropped,
            remaining = seg_valid,
            "gc_segment_collected"
        );
        Ok(report)
    }

    fn summary_mismatch(
        &self,
        segno: SegmentNo,
        sec: SectionNo,
        summary_kind: SegKind,
        table_kind: SegKind,
    ) -> LfsError {
        let arena = self.alloc.arena();
        let block = arena.geometry().start_block(segno).0;
        let detail = format!(
            "summary of segment {segno} is {summary_kind} but the table says {table_kind}"
        );
        arena.health().flag(block, &detail);
        arena.write(|_, index| index.blacklist(sec));
        self.counters.blacklisted.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            target: "lfs::gc",
            %segno,
            %summary_kind,
            %table_kind,
            "gc_summary_mismatch"
        );
        LfsError::consistency(block, detail)
    }

    fn relocation_failed(
        &self,
        state: &mut GcState,
        segno: SegmentNo,
        policy: VictimPolicy,
        detail: &str,
    ) {
        self.counters.relocation_failures.fetch_add(1, Ordering::Relaxed);
        let attempts = state.retries.entry(segno).or_insert(0);
        *attempts += 1;
        let attempts = *attempts;
        if attempts <= self.config.relocation_retry_limit {
            state.next_victim = Some((segno, policy));
            tracing::warn!(
                target: "lfs::gc",
                %segno,
                attempts,
                detail,
                "gc_relocation_retry_scheduled"
            );
            return;
        }

        state.retries.remove(&segno);
        state.next_victim = None;
        let arena = self.alloc.arena();
        let geo = *arena.geometry();
        arena.write(|_, index| index.blacklist(geo.section_of(segno)));
        self.counters.blacklisted.fetch_add(1, Ordering::Relaxed);
        arena
            .health()
            .flag(geo.start_block(segno).0, "segment relocation keeps failing");
        tracing::error!(target: "lfs::gc", %segno, attempts, detail, "gc_victim_blacklisted");
    }

    fn note_stuck(&self, state: &mut GcState, sec: SectionNo) {
        let stuck = state.stuck.get_or_insert(StuckVictim {
            section: sec,
            passes: 0,
        });
        stuck.passes += 1;
        if stuck.passes <= self.config.stuck_pass_limit {
            return;
        }
        let passes = stuck.passes;
        state.stuck = None;
        let arena = self.alloc.arena();
        let geo = *arena.geometry();
        if state
            .next_victim
            .is_some_and(|(seg, _)| geo.section_of(seg) == sec)
        {
            state.next_victim = None;
        }
        arena.write(|_, index| index.skip_for_run(sec));
        state.stuck_sections += 1;
        self.counters.stuck_sections.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            target: "lfs::gc",
            section = sec.0,
            passes,
            stuck_sections = state.stuck_sections,
            "gc_victim_stuck"
        );
        if state.stuck_sections >= self.config.stuck_fsck_limit {
            arena.health().flag(
                geo.start_block(geo.first_segment(sec)).0,
                "garbage collection keeps failing to free sections",
            );
        }
    }

    fn finish_run(&self, state: &mut GcState) {
        state.stuck = None;
        self.alloc.arena().write(|_, index| {
            index.clear_run_skips();
            index.set_cur_victim_sec(None);
            index.set_last_victim(VictimCursor::AllocNext, 0);
        });
    }

    fn not_enough_free(&self, freed: u32) -> bool {
        let tuning = self.alloc.tuning();
        let free = self.alloc.arena().read(|_, index| index.free_sections());
        tuning
            .levels
            .has_not_enough_free_secs(free, freed, 0, tuning.dirty_meta)
    }

    fn write_checkpoint(&self, outcome: &mut GcOutcome) -> Result<()> {
        let written = self.checkpoint.write_checkpoint(CheckpointReason::Gc, None)?;
        if !written.skipped {
            outcome.checkpoints += 1;
            self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn checkpoint_enabled(&self) -> bool {
        self.alloc
            .arena()
            .read(|table, _| !table.checkpoint_disabled())
    }

    /// Checkpoint when prefree sections exist and checkpoints are enabled.
    fn checkpoint_if_prefree(&self, outcome: &mut GcOutcome) -> Result<bool> {
        let prefree = self.alloc.arena().read(|_, index| index.prefree_sections());
        if prefree == 0 || !self.checkpoint_enabled() {
            return Ok(false);
        }
        self.write_checkpoint(outcome)?;
        Ok(true)
    }

    #[must_use]
    pub fn stats(&self) -> GcStats {
        let c = &self.counters;
        GcStats {
            runs: c.runs.load(Ordering::Relaxed),
            fg_passes: c.fg_passes.load(Ordering::Relaxed),
            bg_passes: c.bg_passes.load(Ordering::Relaxed),
            sections_freed: c.sections_freed.load(Ordering::Relaxed),
            blocks_moved: c.blocks_moved.load(Ordering::Relaxed),
            blocks_dropped: c.blocks_dropped.load(Ordering::Relaxed),
            relocation_failures: c.relocation_failures.load(Ordering::Relaxed),
            blacklisted: c.blacklisted.load(Ordering::Relaxed),
            stuck_sections: c.stuck_sections.load(Ordering::Relaxed),
            no_victim: c.no_victim.load(Ordering::Relaxed),
            checkpoints: c.checkpoints.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{Fixture, geo, owner, pattern};
    use lfs_block::SegmentSummary;
    use parking_lot::Mutex as TestMutex;

    fn sec(seg: SegmentNo) -> SectionNo {
        SectionNo(seg.0)
    }

    // ── Selection and relocation ────────────────────────────────────────────

    #[test]
    fn greedy_collects_the_ten_block_segment_before_the_full_one() {
        let mut fx = Fixture::new(512);
        let a = fx.write(SegKind::HotData, 512);
        let b = fx.write(SegKind::HotData, 512);
        fx.write(SegKind::HotData, 1);
        for &addr in &a[..502] {
            fx.kill(addr);
        }
        for &addr in &b[..12] {
            fx.kill(addr);
        }
        let (seg_a, seg_b) = (fx.seg_of(a[0]), fx.seg_of(b[0]));
        assert_eq!(fx.valid(seg_a), 10);
        assert_eq!(fx.valid(seg_b), 500);

        let outcome = fx.gc.run(true, false, None).expect("gc");
        assert_eq!(outcome.victims, vec![seg_a]);
        assert_eq!(outcome.blocks_moved, 10);
        assert_eq!(outcome.sections_freed, 1);
        assert_eq!(outcome.checkpoints, 1);
        assert_eq!(fx.valid(seg_b), 500);

        for (i, &old) in a.iter().enumerate().skip(502) {
            let id = u64::try_from(i).expect("index") + 1;
            let new = fx.resolver.block_of(owner(id)).expect("still owned");
            assert_ne!(new, old);
            assert_eq!(fx.device.read_block(new).expect("read").as_slice(), pattern(id));
            let kind = fx.alloc.arena().read(|table, _| table.kind(fx.seg_of(new)));
            assert_eq!(kind, SegKind::ColdData);
        }
        assert!(fx.alloc.arena().read(|_, index| !index.is_inuse(seg_a)), "freed at checkpoint");
    }

    #[test]
    fn unowned_blocks_are_dropped_instead_of_moved() {
        let mut fx = Fixture::new(4);
        let a = fx.write(SegKind::HotData, 4);
        fx.write(SegKind::HotData, 1);
        fx.resolver.unbind(owner(1));
        fx.resolver.unbind(owner(2));
        fx.kill(a[2]);
        let seg = fx.seg_of(a[0]);
        assert_eq!(fx.valid(seg), 3);

        let outcome = fx.gc.run(true, false, None).expect("gc");
        assert_eq!(outcome.victims, vec![seg]);
        assert_eq!(outcome.blocks_dropped, 2);
        assert_eq!(outcome.blocks_moved, 1);
        assert_eq!(outcome.sections_freed, 1);
        assert_ne!(fx.resolver.block_of(owner(4)), Some(a[3]));
    }

    #[test]
    fn multi_segment_section_is_collected_over_consecutive_passes() {
        let mut fx = Fixture::build(geo(4, 2), GcConfig::default(), None);
        let a = fx.write(SegKind::HotData, 8);
        fx.write(SegKind::HotData, 1);
        fx.kill(a[0]);
        fx.kill(a[4]);
        let (first, second) = (fx.seg_of(a[0]), fx.seg_of(a[4]));
        assert_eq!(second.0, first.0 + 1);

        let outcome = fx.gc.run(true, false, None).expect("gc");
        assert_eq!(outcome.victims, vec![first, second]);
        assert_eq!(outcome.blocks_moved, 6);
        assert_eq!(outcome.sections_freed, 1);
        assert_eq!(fx.gc.pending_victim(), None);
    }

    #[test]
    fn offload_is_tried_before_the_software_copy() {
        #[derive(Default)]
        struct Recording {
            calls: TestMutex<Vec<(BlockAddr, BlockAddr)>>,
            fail: bool,
        }
        impl RelocationOffload for Recording {
            fn relocate(&self, src: BlockAddr, dst: BlockAddr) -> Result<()> {
                self.calls.lock().push((src, dst));
                if self.fail { Err(LfsError::Again) } else { Ok(()) }
            }
        }

        for fail in [false, true] {
            let offload = Arc::new(Recording {
                fail,
                ..Recording::default()
            });
            let mut fx = Fixture::build(
                geo(4, 1),
                GcConfig::default(),
                Some(Arc::clone(&offload) as Arc<dyn RelocationOffload>),
            );
            let a = fx.write(SegKind::HotData, 4);
            fx.write(SegKind::HotData, 1);
            for &addr in &a[..3] {
                fx.kill(addr);
            }
            let (reads_before, _) = fx.device.io_counts();
            fx.gc.run(true, false, None).expect("gc");
            let (reads_after, _) = fx.device.io_counts();

            assert_eq!(offload.calls.lock().len(), 1);
            if fail {
                assert_eq!(reads_after, reads_before + 1, "software fallback");
                let new = fx.resolver.block_of(owner(4)).expect("owned");
                assert_eq!(fx.device.read_block(new).expect("read").as_slice(), pattern(4));
            } else {
                assert_eq!(reads_after, reads_before);
            }
        }
    }

    // ── Failures ────────────────────────────────────────────────────────────

    #[test]
    fn failed_second_copy_keeps_every_block_and_schedules_retry() {
        let mut fx = Fixture::new(4);
        let a = fx.write(SegKind::HotData, 4);
        fx.write(SegKind::HotData, 1);
        fx.kill(a[0]);
        let seg = fx.seg_of(a[0]);
        fx.device.inject_read_failure(a[2]);

        let outcome = fx.gc.run(false, true, Some(seg)).expect("gc");
        assert_eq!(outcome.relocation_failures, 1);
        assert_eq!(outcome.blocks_moved, 0);
        assert_eq!(fx.valid(seg), 3);
        assert_eq!(fx.alloc.arena().usage().valid_blocks, 4, "targets rolled back");
        assert_eq!(fx.gc.pending_victim(), Some(seg));
        for (id, &addr) in (2..=4).zip(&a[1..]) {
            assert_eq!(fx.resolver.owner_of(addr), Some(owner(id)));
        }
        assert!(!fx.alloc.arena().health().need_fsck());

        fx.device.clear_faults();
        let outcome = fx.gc.run(false, true, None).expect("retry");
        assert_eq!(outcome.victims, vec![seg]);
        assert_eq!(outcome.blocks_moved, 3);
        assert_eq!(fx.valid(seg), 0);
        assert_eq!(fx.gc.pending_victim(), None);
        assert_eq!(fx.gc.stats().relocation_failures, 1);
    }

    #[test]
    fn exhausted_retries_blacklist_and_flag_the_volume() {
        let mut fx = Fixture::with_config(
            4,
            GcConfig {
                relocation_retry_limit: 1,
                ..GcConfig::default()
            },
        );
        let a = fx.write(SegKind::HotData, 4);
        fx.write(SegKind::HotData, 1);
        fx.kill(a[0]);
        let seg = fx.seg_of(a[0]);
        fx.device.inject_read_failure(a[1]);

        fx.gc.run(false, true, Some(seg)).expect("first failure");
        assert_eq!(fx.gc.pending_victim(), Some(seg));
        fx.gc.run(false, true, None).expect("second failure");
        assert_eq!(fx.gc.pending_victim(), None);
        assert!(fx.alloc.arena().read(|_, index| index.is_blacklisted(sec(seg))));
        assert!(fx.alloc.arena().health().need_fsck());
        assert_eq!(fx.gc.stats().blacklisted, 1);
        assert!(matches!(fx.gc.run(true, false, None), Err(LfsError::ReadOnly)));
    }

    #[test]
    fn summary_class_mismatch_flags_and_blacklists() {
        let mut fx = Fixture::new(4);
        let a = fx.write(SegKind::HotData, 4);
        fx.write(SegKind::HotData, 1);
        fx.kill(a[0]);
        let seg = fx.seg_of(a[0]);
        fx.meta
            .write_summary(&SegmentSummary {
                segno: seg,
                kind: SegKind::WarmNode,
                next_blkoff: 4,
                alloc_mode: AllocMode::Lfs,
            })
            .expect("summary");

        let err = fx.gc.run(true, false, None).expect_err("mismatch");
        assert!(matches!(err, LfsError::ConsistencyViolation { .. }));
        assert!(fx.alloc.arena().health().need_fsck());
        assert!(fx.alloc.arena().read(|_, index| index.is_blacklisted(sec(seg))));
        assert_eq!(fx.valid(seg), 3);
    }

    #[test]
    fn stuck_section_is_skipped_for_the_run_then_escalates() {
        let mut fx = Fixture::with_config(
            4,
            GcConfig {
                stuck_pass_limit: 2,
                stuck_fsck_limit: 2,
                relocation_retry_limit: 100,
                ..GcConfig::default()
            },
        );
        let a = fx.write(SegKind::HotData, 4);
        fx.write(SegKind::HotData, 1);
        for &addr in &a[..3] {
            fx.kill(addr);
        }
        let seg = fx.seg_of(a[0]);
        fx.resolver.set_fail_repoint(true);

        let outcome = fx.gc.run(true, false, None).expect("gc");
        assert_eq!(outcome.passes, 3);
        assert_eq!(outcome.relocation_failures, 3);
        assert!(outcome.no_victim);
        assert_eq!(fx.gc.stats().stuck_sections, 1);
        assert!(!fx.alloc.arena().health().need_fsck());
        assert!(
            fx.alloc.arena().read(|_, index| !index.is_run_skipped(sec(seg))),
            "skip set lasts one run"
        );
        assert_eq!(fx.valid(seg), 1);

        assert!(matches!(fx.gc.run(true, false, None), Err(LfsError::ReadOnly)));
        assert_eq!(fx.gc.stats().stuck_sections, 2);
        assert!(fx.alloc.arena().health().need_fsck());
    }

    // ── Free-space floor ────────────────────────────────────────────────────

    #[test]
    fn sync_gc_below_the_floor_frees_a_section() {
        let mut fx = Fixture::new(4);
        fx.write(SegKind::ColdData, 4);
        let hot = fx.write(SegKind::HotData, 28);
        assert_eq!(fx.free_sections(), 0);
        assert!(fx.gc.pressure().not_enough_free);
        for i in [0, 1, 12, 13] {
            fx.kill(hot[i]);
        }

        let outcome = fx.gc.run(true, false, None).expect("gc");
        assert_eq!(outcome.sections_freed, 1);
        assert_eq!(outcome.blocks_moved, 2);
        assert_eq!(fx.free_sections(), 1);
        assert_eq!(fx.gc.pressure().level, 2);
    }

    /// Every segment in use and the holes not yet checkpointed: the first
    /// copy finds no target until a checkpoint releases them.
    fn full_with_uncheckpointed_holes() -> (Fixture, Vec<BlockAddr>) {
        let mut fx = Fixture::new(4);
        fx.write(SegKind::ColdData, 4);
        let hot = fx.write(SegKind::HotData, 28);
        for i in [0, 1, 12, 13] {
            fx.kill(hot[i]);
        }
        (fx, hot)
    }

    #[test]
    fn exhausted_targets_checkpoint_once_and_retry_the_victim() {
        let (fx, hot) = full_with_uncheckpointed_holes();
        let dirty = [fx.seg_of(hot[0]), fx.seg_of(hot[12])];

        let outcome = fx.gc.run(true, false, None).expect("gc");
        assert_eq!(outcome.passes, 1);
        assert!(dirty.contains(&outcome.victims[0]));
        assert_eq!(outcome.blocks_moved, 2);
        assert_eq!(outcome.sections_freed, 1);
        assert_eq!(outcome.checkpoints, 2, "one to release holes, one after the free");
        assert_eq!(fx.valid(outcome.victims[0]), 0);
        for id in [7, 8, 19, 20] {
            let addr = fx.resolver.block_of(owner(id)).expect("still owned");
            assert_ne!(fx.seg_of(addr), outcome.victims[0]);
            assert_eq!(fx.device.read_block(addr).expect("read").as_slice(), pattern(id));
        }
    }

    #[test]
    fn exhausted_targets_without_checkpoints_is_no_space() {
        let (fx, hot) = full_with_uncheckpointed_holes();
        fx.alloc
            .arena()
            .write(|table, _| table.set_checkpoint_disabled(true));

        assert!(matches!(fx.gc.run(true, false, None), Err(LfsError::NoSpace)));
        assert_eq!(fx.valid(fx.seg_of(hot[0])), 2);
        assert_eq!(fx.valid(fx.seg_of(hot[12])), 2);
        assert_eq!(fx.resolver.block_of(owner(7)), Some(hot[2]));
        assert_eq!(fx.resolver.block_of(owner(19)), Some(hot[14]));
    }

    #[test]
    fn sync_run_hitting_the_pass_limit_is_no_space() {
        let mut fx = Fixture::build(
            geo(4, 2),
            GcConfig {
                max_passes: 1,
                ..GcConfig::default()
            },
            None,
        );
        let a = fx.write(SegKind::HotData, 8);
        fx.write(SegKind::HotData, 1);
        fx.kill(a[0]);
        fx.kill(a[4]);

        assert!(matches!(fx.gc.run(true, false, None), Err(LfsError::NoSpace)));
        assert_eq!(fx.valid(fx.seg_of(a[0])), 0);
        assert_eq!(fx.gc.pending_victim(), Some(fx.seg_of(a[4])));
    }

    // ── Idle and cancelled runs ─────────────────────────────────────────────

    #[test]
    fn background_run_with_nothing_to_collect_is_no_victim() {
        let mut fx = Fixture::new(4);
        fx.write(SegKind::HotData, 5);
        assert!(matches!(fx.gc.run(false, true, None), Err(LfsError::NoVictim)));
        assert_eq!(fx.gc.stats().no_victim, 1);
    }

    #[test]
    fn cancel_stops_non_sync_runs_only() {
        let mut fx = Fixture::new(4);
        let a = fx.write(SegKind::HotData, 4);
        fx.write(SegKind::HotData, 1);
        fx.kill(a[0]);

        fx.gc.cancel();
        assert!(matches!(fx.gc.run(false, true, None), Err(LfsError::Cancelled)));
        assert_eq!(fx.valid(fx.seg_of(a[0])), 3);
        let outcome = fx.gc.run(true, false, None).expect("sync gc");
        assert_eq!(outcome.sections_freed, 1);

        fx.gc.resume();
        assert!(!fx.gc.is_cancelled());
        assert!(matches!(fx.gc.run(false, true, None), Err(LfsError::NoVictim)));
    }

    #[test]
    fn sync_gc_without_victims_reports_no_space() {
        let mut fx = Fixture::new(4);
        fx.write(SegKind::HotData, 32);
        assert!(matches!(fx.gc.run(true, false, None), Err(LfsError::NoSpace)));
        assert_eq!(fx.gc.stats().no_victim, 1);
    }

    #[test]
    fn non_background_run_without_pressure_does_nothing() {
        let mut fx = Fixture::new(4);
        let a = fx.write(SegKind::HotData, 4);
        fx.write(SegKind::HotData, 1);
        fx.kill(a[0]);
        let outcome = fx.gc.run(false, false, None).expect("gc");
        assert_eq!(outcome, GcOutcome::default());

        let outcome = fx.gc.run(true, false, None).expect("gc");
        assert_eq!(outcome.sections_freed, 1);
        let outcome = fx.gc.run(true, false, None).expect("gc");
        assert!(outcome.no_victim);
        assert_eq!(outcome.passes, 0);
    }

    #[test]
    fn run_end_resets_victim_markers() {
        let mut fx = Fixture::new(4);
        let a = fx.write(SegKind::HotData, 4);
        fx.write(SegKind::HotData, 1);
        fx.kill(a[0]);
        fx.alloc
            .arena()
            .write(|_, index| index.set_last_victim(VictimCursor::AllocNext, 5));
        fx.gc.run(true, false, None).expect("gc");
        fx.alloc.arena().read(|_, index| {
            assert_eq!(index.cur_victim_sec(), None);
            assert_eq!(index.last_victim(VictimCursor::AllocNext), 0);
        });
    }
}
