//! The mounted volume.

use crate::{VolumeConfig, VolumeDevices, VolumeStats};
use lfs_alloc::{SegmentAllocator, Tuning};
use lfs_block::CheckpointReason;
use lfs_checkpoint::{CheckpointOutcome, CheckpointPipeline, TrimWindow};
use lfs_discard::{DiscardManager, DiscardWorker};
use lfs_error::{LfsError, Result};
use lfs_gc::{GcCollaborators, GcDaemon, GcManager, GcOutcome, WakeReason};
use lfs_segment::{
    DirtyMetaSections, GcLevels, MonotonicClock, MtimeSource, SegmentArena, SegmentTable,
    VolumeHealth,
};
use lfs_types::{AllocDiscipline, BlockAddr, GcMode, Geometry, SegKind};
use lfs_victim::VictimSelector;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[derive(Debug, Default)]
struct Workers {
    gc: Option<GcDaemon>,
    discard: Option<DiscardWorker>,
}

/// A formatted or mounted volume.
///
/// All methods take `&self`; share the volume behind an `Arc`. Workers are
/// optional: without [`start_workers`](Self::start_workers) space is only
/// reclaimed by [`trigger_gc`](Self::trigger_gc) and emergency collection
/// on the write path, and TRIM only reaches the device through
/// [`trim_range`](Self::trim_range) or the shutdown drain.
pub struct Volume {
    geo: Geometry,
    config: VolumeConfig,
    alloc: Arc<SegmentAllocator>,
    discard: Arc<DiscardManager>,
    checkpoint: Arc<CheckpointPipeline>,
    gc: Arc<GcManager>,
    bad_sections: AtomicU32,
    workers: Mutex<Workers>,
    shut_down: AtomicBool,
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("geometry", &self.geo)
            .field("checkpoint", &self.checkpoint)
            .field("gc", &self.gc)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Volume {
    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Create an empty volume on `geo` and commit its first checkpoint.
    pub fn format(geo: Geometry, config: VolumeConfig, devices: VolumeDevices) -> Result<Self> {
        config.validate(&geo)?;
        let health = Arc::new(VolumeHealth::new(config.consistency));
        let table = SegmentTable::new(geo, health)?;
        let clock = devices
            .clock
            .clone()
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()) as Arc<dyn MtimeSource>);
        let volume = Self::assemble(table, 0, clock, config, devices)?;
        let outcome = volume.write_checkpoint()?;
        tracing::info!(
            target: "lfs::core",
            main_segments = geo.main_segments,
            segs_per_sec = geo.segs_per_sec,
            blocks_per_seg = geo.blocks_per_seg,
            seq = outcome.seq,
            "volume_formatted"
        );
        Ok(volume)
    }

    /// Rebuild the volume from the last checkpoint in `devices.meta`.
    ///
    /// The segment table comes back from the persisted SIT, the free/dirty
    /// index is derived from it and the write heads resume at their
    /// persisted cursors. Blocks written after that checkpoint are gone.
    pub fn mount(geo: Geometry, config: VolumeConfig, devices: VolumeDevices) -> Result<Self> {
        config.validate(&geo)?;
        let state = devices.meta.load()?.ok_or_else(|| {
            LfsError::Config("no checkpoint found; the volume is not formatted".to_owned())
        })?;
        let health = Arc::new(VolumeHealth::new(config.consistency));
        let table = SegmentTable::restore(geo, health, &state.sit)?;
        table.verify()?;
        let (_, newest_mtime) = table.mtime_bounds();
        let clock = devices
            .clock
            .clone()
            .unwrap_or_else(|| {
                Arc::new(MonotonicClock::resume_after(newest_mtime)) as Arc<dyn MtimeSource>
            });
        let volume = Self::assemble(table, state.seq, clock, config, devices)?;
        volume.alloc.restore(&state.heads)?;
        let usage = volume.alloc.arena().usage();
        tracing::info!(
            target: "lfs::core",
            seq = state.seq,
            heads = state.heads.len(),
            free_sections = usage.free_sections,
            valid_blocks = usage.valid_blocks,
            "volume_mounted"
        );
        Ok(volume)
    }

    fn assemble(
        table: SegmentTable,
        last_seq: u64,
        clock: Arc<dyn MtimeSource>,
        config: VolumeConfig,
        devices: VolumeDevices,
    ) -> Result<Self> {
        let geo = *table.geometry();
        let health = Arc::clone(table.health());
        let levels = GcLevels::compute(&geo, 0)?;
        let arena = Arc::new(SegmentArena::new(table));
        let discard = Arc::new(DiscardManager::new(
            devices.trim,
            Arc::clone(&devices.monitor),
            health,
            config.discard.clone(),
        ));
        let alloc = Arc::new(SegmentAllocator::new(
            arena,
            VictimSelector::new(config.victim),
            Arc::clone(&discard),
            Arc::clone(&devices.meta),
            clock,
            config.alloc,
            Tuning::new(levels),
        ));
        let checkpoint = Arc::new(CheckpointPipeline::new(
            Arc::clone(&alloc),
            Arc::clone(&discard),
            Arc::clone(&devices.meta),
            last_seq,
        ));
        let gc = Arc::new(GcManager::new(
            Arc::clone(&alloc),
            Arc::clone(&checkpoint),
            VictimSelector::new(config.victim),
            GcCollaborators {
                meta: devices.meta,
                resolver: devices.resolver,
                device: devices.device,
                offload: devices.offload,
                monitor: devices.monitor,
            },
            config.gc,
        ));
        Ok(Self {
            geo,
            config,
            alloc,
            discard,
            checkpoint,
            gc,
            bad_sections: AtomicU32::new(0),
            workers: Mutex::new(Workers::default()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Start the GC and discard workers. Idempotent.
    pub fn start_workers(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(LfsError::ReadOnly);
        }
        let mut workers = self.workers.lock();
        if workers.discard.is_none() && self.discard.is_enabled() {
            workers.discard = Some(DiscardWorker::spawn(Arc::clone(&self.discard))?);
        }
        if workers.gc.is_none() {
            workers.gc = Some(GcDaemon::spawn(Arc::clone(&self.gc))?);
        }
        tracing::debug!(target: "lfs::core", discard = workers.discard.is_some(), "workers_started");
        Ok(())
    }

    /// Stop the workers, commit an unmount checkpoint and drain the discard
    /// queue. Later calls do nothing.
    ///
    /// The drain runs even when the checkpoint fails; the checkpoint error
    /// is returned afterwards.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (gc, discard) = {
            let mut workers = self.workers.lock();
            (workers.gc.take(), workers.discard.take())
        };
        if let Some(mut gc) = gc {
            gc.shutdown();
        }
        let checkpoint = self
            .checkpoint
            .write_checkpoint(CheckpointReason::Umount, None);
        if let Err(err) = &checkpoint {
            tracing::error!(target: "lfs::core", error = %err, "umount_checkpoint_failed");
        }
        if let Some(mut discard) = discard {
            discard.shutdown();
        }
        let dropped = self.discard.umount_drain();
        tracing::info!(
            target: "lfs::core",
            seq = self.checkpoint.last_seq(),
            discard_dropped = dropped,
            "volume_shut_down"
        );
        checkpoint.map(|_| ())
    }

    // ── Write path ──────────────────────────────────────────────────────────

    /// Next block for a `kind` write.
    ///
    /// `NoSpace` from the allocator triggers one synchronous GC run and a
    /// single retry when `emergency_gc` is set.
    pub fn allocate_block(&self, kind: SegKind, discipline: AllocDiscipline) -> Result<BlockAddr> {
        let addr = match self.alloc.allocate_block(kind, discipline) {
            Err(LfsError::NoSpace) if self.config.emergency_gc => {
                self.emergency_gc(kind)?;
                self.alloc.allocate_block(kind, discipline)?
            }
            other => other?,
        };
        if self.config.wake_gc_on_pressure && self.gc.pressure().not_enough_free {
            self.gc.wake(WakeReason::PressureChanged);
        }
        Ok(addr)
    }

    fn emergency_gc(&self, kind: SegKind) -> Result<()> {
        tracing::info!(target: "lfs::core", %kind, "allocation_emergency_gc");
        match self.gc.run(true, false, None) {
            Ok(outcome) => {
                tracing::debug!(
                    target: "lfs::core",
                    sections_freed = outcome.sections_freed,
                    blocks_moved = outcome.blocks_moved,
                    "emergency_gc_finished"
                );
                Ok(())
            }
            // The retry reports the exhaustion.
            Err(LfsError::NoSpace | LfsError::NoVictim) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// The block at `addr` no longer holds live data.
    pub fn invalidate_block(&self, addr: BlockAddr) -> Result<()> {
        self.alloc.invalidate_block(addr).map(|_| ())
    }

    // ── Reclaim ─────────────────────────────────────────────────────────────

    /// Run the collector on the caller's thread. A `sync` run keeps going
    /// until a section is freed.
    ///
    /// A run that finds nothing to collect is reported through
    /// [`GcOutcome::no_victim`] rather than as an error.
    pub fn trigger_gc(&self, sync: bool) -> Result<GcOutcome> {
        match self.gc.run(sync, true, None) {
            Err(LfsError::NoVictim) => Ok(GcOutcome {
                no_victim: true,
                ..GcOutcome::default()
            }),
            other => other,
        }
    }

    /// Trim every free block in `[start, start + len)`.
    pub fn trim_range(&self, start: u64, len: u64) -> Result<u64> {
        self.trim_range_with(start, len, 1)
    }

    /// Trim free space in blocks `[start, start + len)`.
    ///
    /// A trim checkpoint queues every free run of at least `minlen` blocks
    /// in the window, then the queued commands overlapping the range are
    /// sent and waited for. Returns the blocks trimmed.
    pub fn trim_range_with(&self, start: u64, len: u64, minlen: u32) -> Result<u64> {
        let end = start.checked_add(len).ok_or_else(|| {
            LfsError::Config(format!("trim range {start}+{len} overflows"))
        })?;
        let Some(window) = TrimWindow::for_blocks(&self.geo, start, end, minlen) else {
            return Ok(0);
        };
        self.checkpoint
            .write_checkpoint(CheckpointReason::Trim, Some(window))?;
        self.discard.trim_range(start, end, minlen)
    }

    /// Commit a checkpoint now.
    pub fn write_checkpoint(&self) -> Result<CheckpointOutcome> {
        self.checkpoint.write_checkpoint(CheckpointReason::Sync, None)
    }

    // ── Tuning ──────────────────────────────────────────────────────────────

    pub fn set_gc_mode(&self, mode: GcMode) {
        self.alloc.set_gc_mode(mode);
        self.gc.wake(WakeReason::PressureChanged);
        tracing::info!(target: "lfs::core", ?mode, "gc_mode_set");
    }

    /// Stop or resume checkpoints. Resuming commits one straight away so
    /// space freed in the meantime comes back.
    pub fn set_checkpoint_disabled(&self, disabled: bool) -> Result<()> {
        if disabled {
            self.write_checkpoint()?;
        }
        self.alloc
            .arena()
            .write(|table, _| table.set_checkpoint_disabled(disabled));
        tracing::info!(target: "lfs::core", disabled, "checkpoint_disabled_set");
        if !disabled {
            self.write_checkpoint()?;
        }
        Ok(())
    }

    pub fn set_dirty_meta_sections(&self, dirty: DirtyMetaSections) {
        self.alloc.set_dirty_meta(dirty);
    }

    /// Retire `count` sections as bad and recompute the GC thresholds.
    pub fn report_bad_sections(&self, count: u32) -> Result<GcLevels> {
        let levels = GcLevels::compute(&self.geo, count)?;
        self.alloc.set_levels(levels);
        self.bad_sections.store(count, Ordering::Relaxed);
        tracing::warn!(
            target: "lfs::core",
            bad_sections = count,
            reserved_sections = levels.reserved_sections,
            l3 = levels.l3,
            "bad_sections_reported"
        );
        self.gc.wake(WakeReason::PressureChanged);
        Ok(levels)
    }

    // ── Introspection ───────────────────────────────────────────────────────

    /// 0 (plenty of space) to 5 by GC band, or 6 when foreground GC is
    /// required.
    pub fn volume_pressure_level(&self) -> u8 {
        self.gc.pressure().level
    }

    pub fn stats(&self) -> VolumeStats {
        let arena = self.alloc.arena();
        VolumeStats {
            usage: arena.usage(),
            pressure_level: self.volume_pressure_level(),
            bad_sections: self.bad_sections.load(Ordering::Relaxed),
            need_fsck: arena.health().need_fsck(),
            checkpoint_disabled: arena.read(|table, _| table.checkpoint_disabled()),
            alloc: self.alloc.stats(),
            gc: self.gc.stats(),
            discard: self.discard.stats(),
            checkpoint: self.checkpoint.stats(),
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<SegmentAllocator> {
        &self.alloc
    }

    pub fn gc(&self) -> &Arc<GcManager> {
        &self.gc
    }

    pub fn discard(&self) -> &Arc<DiscardManager> {
        &self.discard
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        let workers = self.workers.get_mut();
        if let Some(mut gc) = workers.gc.take() {
            gc.shutdown();
        }
        if let Some(mut discard) = workers.discard.take() {
            discard.shutdown();
        }
    }
}
