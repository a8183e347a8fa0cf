//! Traits through which the filesystem layer answers questions the segment
//! manager cannot answer itself, plus in-memory implementations.
//!
//! - [`ReferenceResolver`]: who owns a live block, and repointing it after a
//!   move.
//! - [`MetaStore`]: durable home for head summaries and checkpoints.
//! - [`RelocationOffload`]: optional device-side block copy.

use lfs_error::{LfsError, Result};
use lfs_types::{AllocMode, BlockAddr, ObjectRef, SegKind, SegmentNo};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Liveness oracle and back-reference updater.
pub trait ReferenceResolver: Send + Sync {
    /// Object currently referencing `block`, or `None` if the block is dead.
    fn owner_of(&self, block: BlockAddr) -> Option<ObjectRef>;

    /// Atomically move `owner`'s reference from `old` to `new`.
    fn repoint(&self, owner: ObjectRef, old: BlockAddr, new: BlockAddr) -> Result<()>;
}

/// Device-side copy of a single block.
pub trait RelocationOffload: Send + Sync {
    fn relocate(&self, src: BlockAddr, dst: BlockAddr) -> Result<()>;
}

/// Write-position summary of a segment, flushed whenever a write head leaves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSummary {
    pub segno: SegmentNo,
    pub kind: SegKind,
    pub next_blkoff: u32,
    pub alloc_mode: AllocMode,
}

/// Persisted cursor of one write head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadCursor {
    pub kind: SegKind,
    pub segno: SegmentNo,
    pub next_blkoff: u32,
    pub alloc_mode: AllocMode,
}

/// One segment's persisted table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SitRecord {
    pub segno: SegmentNo,
    pub kind: SegKind,
    pub valid_blocks: u32,
    pub mtime: u64,
    /// Live bitmap, one bit per block, LSB first.
    pub valid_map: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    /// Explicit request from the filesystem layer.
    Sync,
    /// Collector promoting freed sections.
    Gc,
    /// Full-range trim.
    Trim,
    Umount,
}

/// Everything the segment manager persists at a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointImage {
    pub seq: u64,
    pub reason: CheckpointReason,
    pub heads: Vec<HeadCursor>,
    /// Entries changed since the previous checkpoint.
    pub sit_journal: Vec<SitRecord>,
    pub free_segments: u32,
    pub valid_blocks: u64,
}

/// State restored at mount.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedState {
    pub seq: u64,
    pub heads: Vec<HeadCursor>,
    pub sit: Vec<SitRecord>,
}

/// Durable metadata store.
pub trait MetaStore: Send + Sync {
    fn write_summary(&self, summary: &SegmentSummary) -> Result<()>;

    fn read_summary(&self, segno: SegmentNo) -> Result<Option<SegmentSummary>>;

    /// Persist a checkpoint. On `Err` nothing from `image` may become durable.
    fn commit_checkpoint(&self, image: &CheckpointImage) -> Result<()>;

    /// Last committed state, or `None` for a freshly formatted volume.
    fn load(&self) -> Result<Option<PersistedState>>;
}

// ── In-memory metadata store ────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MetaState {
    summaries: HashMap<SegmentNo, SegmentSummary>,
    sit: BTreeMap<SegmentNo, SitRecord>,
    heads: Vec<HeadCursor>,
    seq: Option<u64>,
    commits: Vec<(u64, CheckpointReason)>,
    fail_commits: u32,
}

/// In-memory [`MetaStore`] that folds each checkpoint journal into a full
/// table, the way an on-disk SIT area would.
#[derive(Debug, Default)]
pub struct MemMetaStore {
    state: Mutex<MetaState>,
}

impl MemMetaStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` checkpoint commits.
    pub fn fail_next_commits(&self, count: u32) {
        self.state.lock().fail_commits = count;
    }

    /// `(seq, reason)` of every successful commit.
    #[must_use]
    pub fn commits(&self) -> Vec<(u64, CheckpointReason)> {
        self.state.lock().commits.clone()
    }

    #[must_use]
    pub fn summary_count(&self) -> usize {
        self.state.lock().summaries.len()
    }
}

impl MetaStore for MemMetaStore {
    fn write_summary(&self, summary: &SegmentSummary) -> Result<()> {
        self.state
            .lock()
            .summaries
            .insert(summary.segno, summary.clone());
        Ok(())
    }

    fn read_summary(&self, segno: SegmentNo) -> Result<Option<SegmentSummary>> {
        Ok(self.state.lock().summaries.get(&segno).cloned())
    }

    fn commit_checkpoint(&self, image: &CheckpointImage) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            tracing::debug!(target: "lfs::block", seq = image.seq, "meta_injected_commit_failure");
            return Err(LfsError::Checkpoint(format!(
                "injected commit failure at seq {}",
                image.seq
            )));
        }
        for record in &image.sit_journal {
            state.sit.insert(record.segno, record.clone());
        }
        state.heads.clone_from(&image.heads);
        state.seq = Some(image.seq);
        state.commits.push((image.seq, image.reason));
        tracing::trace!(
            target: "lfs::block",
            seq = image.seq,
            reason = ?image.reason,
            journal = image.sit_journal.len(),
            "meta_checkpoint_committed"
        );
        Ok(())
    }

    fn load(&self) -> Result<Option<PersistedState>> {
        let state = self.state.lock();
        Ok(state.seq.map(|seq| PersistedState {
            seq,
            heads: state.heads.clone(),
            sit: state.sit.values().cloned().collect(),
        }))
    }
}

// ── In-memory resolver ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ResolverState {
    by_block: HashMap<BlockAddr, ObjectRef>,
    by_owner: HashMap<ObjectRef, BlockAddr>,
    fail_repoint: bool,
}

/// Bidirectional block ↔ owner map.
#[derive(Debug, Default)]
pub struct MemResolver {
    state: Mutex<ResolverState>,
}

impl MemResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `owner` now lives at `block`. Returns the previous block.
    pub fn bind(&self, owner: ObjectRef, block: BlockAddr) -> Option<BlockAddr> {
        let mut state = self.state.lock();
        let prev = state.by_owner.insert(owner, block);
        if let Some(prev) = prev {
            state.by_block.remove(&prev);
        }
        state.by_block.insert(block, owner);
        prev
    }

    /// Forget `owner`. Returns the block it occupied.
    pub fn unbind(&self, owner: ObjectRef) -> Option<BlockAddr> {
        let mut state = self.state.lock();
        let block = state.by_owner.remove(&owner)?;
        state.by_block.remove(&block);
        Some(block)
    }

    #[must_use]
    pub fn block_of(&self, owner: ObjectRef) -> Option<BlockAddr> {
        self.state.lock().by_owner.get(&owner).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().by_owner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_fail_repoint(&self, fail: bool) {
        self.state.lock().fail_repoint = fail;
    }
}

impl ReferenceResolver for MemResolver {
    fn owner_of(&self, block: BlockAddr) -> Option<ObjectRef> {
        self.state.lock().by_block.get(&block).copied()
    }

    fn repoint(&self, owner: ObjectRef, old: BlockAddr, new: BlockAddr) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_repoint {
            return Err(LfsError::Again);
        }
        if state.by_owner.get(&owner) != Some(&old) {
            return Err(LfsError::consistency(
                old.0,
                format!("owner {}:{} no longer references block", owner.owner, owner.offset),
            ));
        }
        state.by_block.remove(&old);
        state.by_block.insert(new, owner);
        state.by_owner.insert(owner, new);
        Ok(())
    }
}
