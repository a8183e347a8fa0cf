//! The discard command manager.
//!
//! All command state sits behind one mutex. Devices report piece results
//! through a separate completion queue, so a device may complete inline from
//! inside `submit_trim` while the command lock is held; results are folded
//! into command state the next time the lock is taken ("reaped").
//!
//! Waiting uses the queue's generation counter: a waiter samples the
//! generation before it reaps, and sleeps only until the generation moves.

use crate::DiscardConfig;
use crate::cmd::{CmdState, CmdTree, DiscardCmd};
use crate::policy::{DiscardPolicy, PENDING_BUCKETS, PolicyKind, effective_max_discard};
use lfs_block::{IoMonitor, TrimCompletion, TrimDevice, WakeSignal};
use lfs_error::{LfsError, Result};
use lfs_segment::{Mutation, VolumeHealth};
use lfs_types::BlockAddr;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one issue pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueResult {
    /// This many requests went to the device.
    Issued(u32),
    /// Nothing issued because foreground I/O was running.
    Interrupted,
    /// Nothing eligible.
    Idle,
}

/// Reason the discard worker was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiscardWake {
    Queued,
    ShutdownRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscardStats {
    pub commands: usize,
    /// Blocks in Prepared commands.
    pub queued_blocks: u64,
    pub issued_pieces: u64,
    pub issued_blocks: u64,
    pub completed_pieces: u64,
    pub failed_pieces: u64,
    /// Blocks confirmed trimmed by a waiter.
    pub trimmed_blocks: u64,
    pub dropped_commands: u64,
    pub passes: u64,
    pub interrupted_passes: u64,
    pub max_discard_blocks: u64,
}

#[derive(Debug)]
struct Completed {
    id: u64,
    key: u64,
    errno: Option<i32>,
}

#[derive(Debug, Default)]
struct QueueState {
    generation: u64,
    done: Vec<Completed>,
}

#[derive(Debug, Default)]
struct CompletionQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl CompletionQueue {
    fn push(&self, completed: Completed) {
        let mut state = self.state.lock();
        state.done.push(completed);
        state.generation += 1;
        drop(state);
        self.cv.notify_all();
    }

    fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn take(&self) -> Vec<Completed> {
        std::mem::take(&mut self.state.lock().done)
    }

    fn wait_past(&self, generation: u64) {
        let mut state = self.state.lock();
        while state.generation == generation {
            self.cv.wait(&mut state);
        }
    }
}

#[derive(Debug)]
struct State {
    tree: CmdTree,
    stats: DiscardStats,
}

pub struct DiscardManager {
    device: Arc<dyn TrimDevice>,
    monitor: Arc<IoMonitor>,
    health: Arc<VolumeHealth>,
    config: DiscardConfig,
    max_discard: u64,
    state: Mutex<State>,
    completions: Arc<CompletionQueue>,
    signal: WakeSignal<DiscardWake>,
}

impl std::fmt::Debug for DiscardManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscardManager")
            .field("config", &self.config)
            .field("max_discard", &self.max_discard)
            .finish_non_exhaustive()
    }
}

impl DiscardManager {
    #[must_use]
    pub fn new(
        device: Arc<dyn TrimDevice>,
        monitor: Arc<IoMonitor>,
        health: Arc<VolumeHealth>,
        config: DiscardConfig,
    ) -> Self {
        let max_discard = effective_max_discard(device.max_discard_blocks());
        Self {
            device,
            monitor,
            health,
            config,
            max_discard,
            state: Mutex::new(State {
                tree: CmdTree::new(),
                stats: DiscardStats::default(),
            }),
            completions: Arc::new(CompletionQueue::default()),
            signal: WakeSignal::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DiscardConfig {
        &self.config
    }

    /// Largest piece sent to the device, in blocks.
    #[must_use]
    pub fn max_discard_blocks(&self) -> u64 {
        self.max_discard
    }

    /// Discard runs only when configured and the volume needs no check.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && !self.health.need_fsck()
    }

    pub(crate) fn signal(&self) -> &WakeSignal<DiscardWake> {
        &self.signal
    }

    /// Nudge the worker after queueing.
    pub fn wake(&self) {
        self.signal.notify(DiscardWake::Queued);
    }

    fn device_idle(&self) -> bool {
        self.monitor
            .is_idle(Duration::from_millis(self.config.idle_interval_ms))
    }

    // ── Queueing ────────────────────────────────────────────────────────

    /// Queue `len` blocks starting at `start` for TRIM.
    pub fn queue(&self, start: BlockAddr, len: u64) {
        self.queue_range(start.0, start.0, len);
    }

    /// Queue `[lstart, lstart + len)`, mapped to device address `start`.
    pub fn queue_range(&self, lstart: u64, start: u64, len: u64) {
        if !self.config.enabled || len == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.tree.queue_range(lstart, start, len, self.max_discard);
        tracing::trace!(
            target: "lfs::discard",
            lstart,
            len,
            commands = state.tree.len(),
            "discard_queued"
        );
    }

    /// Make `addr` safe to write: carve it out of a queued command, or wait
    /// for an in-flight one covering it.
    pub fn wait_discard_bio(&self, addr: BlockAddr) {
        let generation = self.completions.generation();
        let mut state = self.state.lock();
        self.reap(&mut state);
        let Some(key) = state.tree.covering(addr.0) else {
            return;
        };
        let Some(cmd) = state.tree.get_mut(key) else {
            return;
        };
        match cmd.state {
            CmdState::Prepared => state.tree.punch(key, addr.0),
            CmdState::Done if cmd.waiters == 0 => {
                state.tree.remove(key);
            }
            _ => {
                cmd.waiters += 1;
                let id = cmd.id;
                drop(state);
                self.wait_one(key, id, generation);
            }
        }
    }

    // ── Issue ───────────────────────────────────────────────────────────

    /// Run one issue pass under `policy`.
    pub fn issue(&self, policy: &DiscardPolicy) -> IssueResult {
        self.issue_pass(policy).0
    }

    /// Issue pass returning the sleep interval of the last class visited.
    pub(crate) fn issue_pass(&self, policy: &DiscardPolicy) -> (IssueResult, u64) {
        if !self.is_enabled() {
            return (IssueResult::Idle, policy.max_interval_ms);
        }
        let mut state = self.state.lock();
        self.reap(&mut state);

        let mut issued = 0_u32;
        let mut interrupted = false;
        let mut interval_ms = 0;
        for bucket in (0..PENDING_BUCKETS).rev() {
            if bucket + 1 < policy.granularity as usize {
                break;
            }
            let class = policy.class_for(bucket);
            interval_ms = class.interval_ms;
            for key in state.tree.bucket(bucket) {
                if policy.io_aware
                    && bucket < policy.io_aware_gran as usize
                    && !self.device_idle()
                {
                    interrupted = true;
                    break;
                }
                self.submit_cmd(&mut state, key, class.max_requests, &mut issued);
                if issued >= class.max_requests {
                    break;
                }
            }
            if issued >= class.max_requests || interrupted {
                break;
            }
        }

        self.reap(&mut state);
        state.stats.passes += 1;
        let result = if issued > 0 {
            IssueResult::Issued(issued)
        } else if interrupted {
            state.stats.interrupted_passes += 1;
            IssueResult::Interrupted
        } else {
            IssueResult::Idle
        };
        let queued = state.tree.queued_blocks();
        drop(state);
        if issued > 0 {
            tracing::debug!(
                target: "lfs::discard",
                policy = ?policy.kind,
                issued,
                queued,
                "discard_pass_issued"
            );
        }
        (result, interval_ms)
    }

    /// Send the Prepared command at `key` in pieces of `max_discard`, until
    /// it is exhausted or `issued` reaches `max_requests`.
    fn submit_cmd(&self, state: &mut State, key: u64, max_requests: u32, issued: &mut u32) {
        if *issued >= max_requests {
            return;
        }
        let Some(cmd) = state.tree.get(key) else {
            return;
        };
        if cmd.state != CmdState::Prepared {
            return;
        }
        let id = cmd.id;
        let (mut lstart, mut start, mut remaining) = (cmd.lstart, cmd.start, cmd.len);
        state.tree.begin_submit(key);
        let Some(cmd) = state.tree.get_mut(key) else {
            return;
        };
        cmd.len = 0;

        let mut failed = false;
        while remaining > 0 && *issued < max_requests {
            let mut piece = remaining;
            let mut last = true;
            if piece > self.max_discard {
                piece = self.max_discard;
                last = false;
            }
            *issued += 1;
            if *issued == max_requests {
                last = true;
            }

            let queue = Arc::clone(&self.completions);
            let done = TrimCompletion::new(move |res: Result<()>| {
                queue.push(Completed {
                    id,
                    key,
                    errno: res.err().map(|err| err.to_errno()),
                });
            });
            if let Err(err) = self.device.submit_trim(BlockAddr(start), piece, done) {
                if cmd.state == CmdState::PartiallySubmitted {
                    cmd.state = CmdState::Submitted;
                }
                tracing::warn!(
                    target: "lfs::discard",
                    start,
                    len = piece,
                    error = %err,
                    "discard_submit_failed"
                );
                failed = true;
                break;
            }
            cmd.len += piece;
            cmd.inflight += 1;
            cmd.state = if last {
                CmdState::Submitted
            } else {
                CmdState::PartiallySubmitted
            };
            state.stats.issued_pieces += 1;
            state.stats.issued_blocks += piece;

            lstart += piece;
            start += piece;
            remaining -= piece;
        }

        if cmd.len == 0 {
            state.tree.remove(key);
            state.stats.dropped_commands += 1;
            return;
        }
        if !failed && remaining > 0 {
            state
                .tree
                .queue_range(lstart, start, remaining, self.max_discard);
        }
    }

    /// Fold device results into command state.
    fn reap(&self, state: &mut State) {
        for done in self.completions.take() {
            let Some(cmd) = state.tree.get_mut(done.key).filter(|c| c.id == done.id) else {
                tracing::warn!(
                    target: "lfs::discard",
                    id = done.id,
                    key = done.key,
                    "discard_completion_orphaned"
                );
                continue;
            };
            cmd.inflight = cmd.inflight.saturating_sub(1);
            match done.errno {
                Some(errno) if errno != libc::EOPNOTSUPP => {
                    cmd.error.get_or_insert(errno);
                    state.stats.failed_pieces += 1;
                }
                _ => state.stats.completed_pieces += 1,
            }
            if cmd.inflight == 0 && cmd.state == CmdState::Submitted {
                cmd.state = CmdState::Done;
                if let Some(errno) = cmd.error {
                    let err = LfsError::Discard {
                        start: cmd.start,
                        len: cmd.len,
                        detail: std::io::Error::from_raw_os_error(errno).to_string(),
                    };
                    tracing::warn!(target: "lfs::discard", errno, error = %err, "discard_failed");
                }
            }
        }
    }

    // ── Waiting ─────────────────────────────────────────────────────────

    /// Block until command `id` at `key` is Done, then drop our reference.
    /// Returns the blocks it trimmed if this was the last reference.
    fn wait_one(&self, key: u64, id: u64, mut generation: u64) -> u64 {
        loop {
            {
                let mut state = self.state.lock();
                self.reap(&mut state);
                let Some(cmd) = state.tree.get_mut(key).filter(|c| c.id == id) else {
                    return 0;
                };
                if cmd.state == CmdState::Done {
                    cmd.waiters -= 1;
                    if cmd.waiters > 0 {
                        return 0;
                    }
                    let trimmed = if cmd.error.is_none() { cmd.len } else { 0 };
                    state.tree.remove(key);
                    state.stats.trimmed_blocks += trimmed;
                    return trimmed;
                }
            }
            self.completions.wait_past(generation);
            generation = self.completions.generation();
        }
    }

    /// Wait for every issued command intersecting `[start, end)` that is at
    /// least `policy.granularity` long. Returns the blocks trimmed.
    pub fn wait_range(&self, policy: &DiscardPolicy, start: u64, end: u64) -> u64 {
        let min_len = u64::from(policy.granularity);
        let mut trimmed = 0;
        loop {
            let generation = self.completions.generation();
            let mut target = None;
            {
                let mut state = self.state.lock();
                self.reap(&mut state);
                for key in state.tree.overlapping(start, end) {
                    let Some(cmd) = state.tree.get_mut(key) else {
                        continue;
                    };
                    if cmd.state == CmdState::Prepared || cmd.len < min_len {
                        continue;
                    }
                    if cmd.state == CmdState::Done {
                        if cmd.waiters == 0 {
                            let len = if cmd.error.is_none() { cmd.len } else { 0 };
                            state.tree.remove(key);
                            state.stats.trimmed_blocks += len;
                            trimmed += len;
                        }
                        continue;
                    }
                    cmd.waiters += 1;
                    target = Some((key, cmd.id));
                    break;
                }
            }
            match target {
                Some((key, id)) => trimmed += self.wait_one(key, id, generation),
                None => return trimmed,
            }
        }
    }

    /// Wait for every issued command.
    pub fn wait_all(&self) -> u64 {
        self.wait_range(&DiscardPolicy::full_trim(1), 0, u64::MAX)
    }

    /// Remove every Prepared command. Returns how many were dropped.
    pub fn drop_pending(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.tree.drop_prepared();
        state.stats.dropped_commands += dropped as u64;
        dropped
    }

    /// Final drain: issue large commands, drop the rest, wait for all.
    /// Returns whether anything was dropped.
    pub fn umount_drain(&self) -> bool {
        let policy = DiscardPolicy::preset(PolicyKind::Unmount);
        let result = self.issue(&policy);
        let dropped = self.drop_pending();
        let trimmed = self.wait_all();
        tracing::info!(
            target: "lfs::discard",
            ?result,
            dropped,
            trimmed,
            "discard_drained"
        );
        dropped > 0
    }

    /// User trim of queued commands intersecting `[start, end)` that are at
    /// least `minlen` blocks, in windows of the policy's request budget.
    /// Returns the blocks trimmed.
    pub fn trim_range(&self, start: u64, end: u64, minlen: u32) -> Result<u64> {
        self.health.check(Mutation::Discard)?;
        if !self.config.enabled {
            return Ok(0);
        }
        let policy = DiscardPolicy::full_trim(minlen);
        let window = policy.window();
        let min_len = u64::from(policy.granularity);
        let mut trimmed = 0;
        loop {
            let mut issued = 0;
            {
                let mut state = self.state.lock();
                self.reap(&mut state);
                for key in state.tree.overlapping(start, end) {
                    let eligible = state
                        .tree
                        .get(key)
                        .is_some_and(|c| c.state == CmdState::Prepared && c.len >= min_len);
                    if eligible {
                        self.submit_cmd(&mut state, key, window, &mut issued);
                    }
                    if issued >= window {
                        break;
                    }
                }
                self.reap(&mut state);
            }
            trimmed += self.wait_range(&policy, start, end);
            if issued < window {
                break;
            }
        }
        tracing::info!(target: "lfs::discard", start, end, minlen, trimmed, "trim_range_done");
        Ok(trimmed)
    }

    // ── Introspection ───────────────────────────────────────────────────

    #[must_use]
    pub fn stats(&self) -> DiscardStats {
        let mut state = self.state.lock();
        self.reap(&mut state);
        DiscardStats {
            commands: state.tree.len(),
            queued_blocks: state.tree.queued_blocks(),
            max_discard_blocks: self.max_discard,
            ..state.stats
        }
    }

    /// Snapshot of every command in address order.
    #[must_use]
    pub fn commands(&self) -> Vec<DiscardCmd> {
        let mut state = self.state.lock();
        self.reap(&mut state);
        state.tree.iter().cloned().collect()
    }

    /// Whether any command touches `[start, end)`.
    #[must_use]
    pub fn has_command_in(&self, start: u64, end: u64) -> bool {
        !self.state.lock().tree.overlapping(start, end).is_empty()
    }
}
