//! Seeded mixed workload with end-of-run verification.

use crate::rig::MemVolume;
use anyhow::{Result, bail};
use lfs::{
    AllocDiscipline, GcMode, Geometry, LfsError, ObjectRef, SegKind, VolumeConfig, VolumeStats,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

const WRITER_KINDS: [SegKind; 6] = [
    SegKind::HotData,
    SegKind::WarmData,
    SegKind::ColdData,
    SegKind::HotNode,
    SegKind::WarmNode,
    SegKind::ColdNode,
];

/// Workload shape. Periodic operations fire every N foreground operations;
/// 0 disables them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub seed: u64,
    /// Foreground operations (create, overwrite, delete) to run.
    pub operations: u64,
    pub geometry: Geometry,
    pub block_size: u32,
    pub volume: VolumeConfig,
    pub gc_mode: GcMode,
    /// Live objects stay below this share of the main area, in percent.
    pub max_utilization_pct: u8,
    pub checkpoint_every: u64,
    pub gc_every: u64,
    pub trim_every: u64,
    pub remount_every: u64,
    /// Check every live object after each remount, not only at the end.
    pub verify_on_remount: bool,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            seed: 0x5E6_0A11_0C00_0001,
            operations: 20_000,
            geometry: crate::small_geometry(),
            block_size: 64,
            volume: VolumeConfig::default(),
            gc_mode: GcMode::Normal,
            max_utilization_pct: 70,
            checkpoint_every: 256,
            gc_every: 512,
            trim_every: 4096,
            remount_every: 8192,
            verify_on_remount: true,
        }
    }
}

/// One generated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkloadOp {
    Create { owner: u64, seg_kind: SegKind },
    Overwrite { owner: u64 },
    Delete { owner: u64 },
    Checkpoint,
    Gc,
    Trim,
    Remount,
}

impl WorkloadOp {
    fn name(self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Overwrite { .. } => "overwrite",
            Self::Delete { .. } => "delete",
            Self::Checkpoint => "checkpoint",
            Self::Gc => "gc",
            Self::Trim => "trim",
            Self::Remount => "remount",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadReport {
    pub seed: u64,
    pub operations: u64,
    pub operations_executed: u64,
    pub passed: bool,
    /// Operations refused with `NoSpace`. Not a failure.
    pub enospc: u64,
    /// Operations refused with `Again`.
    pub busy: u64,
    pub live_objects: u64,
    pub op_mix: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Counters of the volume mounted at the end of the run.
    pub stats: VolumeStats,
    pub totals: ReclaimTotals,
    pub duration_us: u64,
}

/// Reclaim counters summed over every mount of a run. Each remount starts
/// the volume's own counters from zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimTotals {
    pub mounts: u64,
    pub gc_runs: u64,
    pub sections_freed: u64,
    pub blocks_moved: u64,
    pub checkpoints: u64,
    pub freed_segments: u64,
    pub trimmed_blocks: u64,
}

impl ReclaimTotals {
    fn add(&mut self, stats: &VolumeStats) {
        self.mounts += 1;
        self.gc_runs += stats.gc.runs;
        self.sections_freed += stats.gc.sections_freed;
        self.blocks_moved += stats.gc.blocks_moved;
        self.checkpoints += stats.checkpoint.committed;
        self.freed_segments += stats.checkpoint.freed_segments;
        self.trimmed_blocks += stats.discard.trimmed_blocks;
    }
}

#[derive(Debug, Clone)]
struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn next_usize(&mut self, upper_exclusive: usize) -> usize {
        if upper_exclusive <= 1 {
            return 0;
        }
        let upper_u64 = u64::try_from(upper_exclusive).unwrap_or(u64::MAX);
        let value = self.next_u64() % upper_u64;
        usize::try_from(value).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy)]
struct LiveObject {
    owner: ObjectRef,
    version: u32,
    kind: SegKind,
}

struct RunState {
    rig: MemVolume,
    live: Vec<LiveObject>,
    next_owner: u64,
    enospc: u64,
    busy: u64,
    executed: u64,
    op_mix: BTreeMap<String, u64>,
    totals: ReclaimTotals,
}

impl RunState {
    fn count(&mut self, op: WorkloadOp) {
        let counter = self.op_mix.entry(op.name().to_owned()).or_insert(0);
        *counter = counter.saturating_add(1);
        self.executed += 1;
    }

    fn position(&self, owner: u64) -> Option<usize> {
        self.live.iter().position(|obj| obj.owner.owner == owner)
    }

    /// Skip `NoSpace` and `Again`; anything else ends the run.
    fn absorb<T>(&mut self, result: lfs::Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(LfsError::NoSpace) => {
                self.enospc += 1;
                Ok(None)
            }
            Err(LfsError::Again) => {
                self.busy += 1;
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn next_op(rng: &mut DeterministicRng, state: &RunState, ceiling: usize) -> WorkloadOp {
    let roll = rng.next_usize(100);
    let live = state.live.len();
    if live == 0 || (roll < 40 && live < ceiling) {
        let seg_kind = WRITER_KINDS[rng.next_usize(WRITER_KINDS.len())];
        return WorkloadOp::Create {
            owner: state.next_owner,
            seg_kind,
        };
    }
    let owner = state.live[rng.next_usize(live)].owner.owner;
    if roll < 80 {
        WorkloadOp::Overwrite { owner }
    } else {
        WorkloadOp::Delete { owner }
    }
}

fn periodic(config: &WorkloadConfig, index: u64) -> Vec<WorkloadOp> {
    let due = |every: u64| every > 0 && (index + 1) % every == 0;
    let mut ops = Vec::new();
    if due(config.checkpoint_every) {
        ops.push(WorkloadOp::Checkpoint);
    }
    if due(config.gc_every) {
        ops.push(WorkloadOp::Gc);
    }
    if due(config.trim_every) {
        ops.push(WorkloadOp::Trim);
    }
    if due(config.remount_every) {
        ops.push(WorkloadOp::Remount);
    }
    ops
}

fn apply(state: &mut RunState, config: &WorkloadConfig, op: WorkloadOp) -> Result<()> {
    state.count(op);
    state.rig.clock.advance(1);
    match op {
        WorkloadOp::Create { owner, seg_kind } => {
            let owner_ref = ObjectRef { owner, offset: 0 };
            let result =
                state
                    .rig
                    .write_object(owner_ref, seg_kind, AllocDiscipline::Auto, 0);
            if state.absorb(result)?.is_some() {
                state.live.push(LiveObject {
                    owner: owner_ref,
                    version: 0,
                    kind: seg_kind,
                });
                state.next_owner += 1;
            }
        }
        WorkloadOp::Overwrite { owner } => {
            let Some(pos) = state.position(owner) else {
                bail!("overwrite of unknown owner {owner}");
            };
            let obj = state.live[pos];
            let version = obj.version.wrapping_add(1);
            let result = state
                .rig
                .write_object(obj.owner, obj.kind, AllocDiscipline::Auto, version);
            if state.absorb(result)?.is_some() {
                state.live[pos].version = version;
            }
        }
        WorkloadOp::Delete { owner } => {
            let Some(pos) = state.position(owner) else {
                bail!("delete of unknown owner {owner}");
            };
            let obj = state.live.swap_remove(pos);
            if !state.rig.delete_object(obj.owner)? {
                bail!("owner {owner} was not bound");
            }
        }
        WorkloadOp::Checkpoint => {
            state.rig.volume.write_checkpoint()?;
        }
        WorkloadOp::Gc => {
            let result = state.rig.volume.trigger_gc(false);
            state.absorb(result)?;
        }
        WorkloadOp::Trim => {
            let geo = state.rig.geometry;
            state
                .rig
                .volume
                .trim_range(geo.main_blkaddr, geo.main_blocks())?;
        }
        WorkloadOp::Remount => {
            let retired = state.rig.remount()?;
            state.totals.add(&retired);
            if config.verify_on_remount {
                verify(state)?;
            }
        }
    }
    Ok(())
}

/// Every live object reads back its last version and the space accounting
/// matches the object count.
fn verify(state: &RunState) -> Result<()> {
    let volume = &state.rig.volume;
    let stats = volume.stats();
    if stats.need_fsck {
        bail!("volume flagged for fsck");
    }
    let live = state.live.len() as u64;
    if stats.usage.valid_blocks != live {
        bail!(
            "valid block count {} does not match {live} live objects",
            stats.usage.valid_blocks
        );
    }
    if state.rig.resolver.len() as u64 != live {
        bail!("resolver holds {} owners, expected {live}", state.rig.resolver.len());
    }
    volume.allocator().arena().read(|table, _| table.verify())?;
    for obj in &state.live {
        if !state.rig.verify_object(obj.owner, obj.version)? {
            bail!(
                "owner {} does not read back version {}",
                obj.owner.owner,
                obj.version
            );
        }
    }
    Ok(())
}

/// Run `config` against a freshly formatted in-memory volume.
pub fn run_workload(config: &WorkloadConfig) -> Result<WorkloadReport> {
    if config.operations == 0 {
        bail!("operations must be greater than zero");
    }
    if config.max_utilization_pct == 0 || config.max_utilization_pct > 100 {
        bail!("max_utilization_pct must be in 1..=100");
    }

    let start = Instant::now();
    let rig = MemVolume::format(config.geometry, config.volume.clone(), config.block_size)?;
    rig.volume.set_gc_mode(config.gc_mode);
    let main_blocks = usize::try_from(config.geometry.main_blocks()).unwrap_or(usize::MAX);
    let ceiling = main_blocks / 100 * usize::from(config.max_utilization_pct);
    let mut state = RunState {
        rig,
        live: Vec::new(),
        next_owner: 1,
        enospc: 0,
        busy: 0,
        executed: 0,
        op_mix: BTreeMap::new(),
        totals: ReclaimTotals::default(),
    };
    let mut rng = DeterministicRng::new(config.seed);

    let mut failure = None;
    'ops: for index in 0..config.operations {
        let op = next_op(&mut rng, &state, ceiling);
        let mut batch = vec![op];
        batch.extend(periodic(config, index));
        for op in batch {
            if let Err(err) = apply(&mut state, config, op) {
                failure = Some(format!("op {index} {op:?}: {err:#}"));
                break 'ops;
            }
        }
    }
    if failure.is_none() {
        if let Err(err) = verify(&state) {
            failure = Some(format!("final verification: {err:#}"));
        }
    }

    let stats = state.rig.volume.stats();
    state.totals.add(&stats);
    tracing::info!(
        target: "lfs::harness",
        seed = config.seed,
        executed = state.executed,
        live = state.live.len(),
        enospc = state.enospc,
        mounts = state.totals.mounts,
        passed = failure.is_none(),
        "workload_finished"
    );
    Ok(WorkloadReport {
        seed: config.seed,
        operations: config.operations,
        operations_executed: state.executed,
        passed: failure.is_none(),
        enospc: state.enospc,
        busy: state.busy,
        live_objects: state.live.len() as u64,
        op_mix: state.op_mix,
        failure,
        stats,
        totals: state.totals,
        duration_us: u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX),
    })
}
