//! Discard commands and the range tree that holds them.
//!
//! Commands are keyed by logical start and never overlap. Prepared commands
//! are additionally linked into a size bucket in arrival order; that link is
//! what the issue pass walks. Only Prepared commands are ever merged, split
//! or shortened, so the key of a submitted command is stable until it is
//! removed.

use crate::policy::{PENDING_BUCKETS, bucket_of};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmdState {
    /// Queued, not yet sent. May be merged or punched.
    Prepared,
    /// Some pieces sent, more to follow in the same pass.
    PartiallySubmitted,
    /// Every piece sent; waiting for completions.
    Submitted,
    /// All pieces completed.
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardCmd {
    pub id: u64,
    pub lstart: u64,
    /// Device address of `lstart`.
    pub start: u64,
    pub len: u64,
    pub state: CmdState,
    /// Threads blocked on this command.
    pub waiters: u32,
    /// Pieces sent and not yet reaped.
    pub inflight: u32,
    /// First non-ignorable errno reported by a piece.
    pub error: Option<i32>,
    /// Arrival sequence while linked into a bucket.
    #[serde(skip)]
    seq: Option<u64>,
}

impl DiscardCmd {
    #[must_use]
    pub fn end(&self) -> u64 {
        self.lstart + self.len
    }

    #[must_use]
    pub fn covers(&self, addr: u64) -> bool {
        self.lstart <= addr && addr < self.end()
    }
}

#[derive(Debug, Clone, Copy)]
struct Extent {
    lstart: u64,
    start: u64,
    len: u64,
}

impl Extent {
    fn end(self) -> u64 {
        self.lstart + self.len
    }
}

#[derive(Debug)]
pub(crate) struct CmdTree {
    cmds: BTreeMap<u64, DiscardCmd>,
    /// Per bucket: arrival sequence -> command key.
    pending: Vec<BTreeMap<u64, u64>>,
    next_seq: u64,
    next_id: u64,
    /// Blocks held by Prepared commands.
    queued_blocks: u64,
}

impl CmdTree {
    pub(crate) fn new() -> Self {
        Self {
            cmds: BTreeMap::new(),
            pending: vec![BTreeMap::new(); PENDING_BUCKETS],
            next_seq: 0,
            next_id: 1,
            queued_blocks: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.cmds.len()
    }

    pub(crate) fn queued_blocks(&self) -> u64 {
        self.queued_blocks
    }

    pub(crate) fn get(&self, key: u64) -> Option<&DiscardCmd> {
        self.cmds.get(&key)
    }

    pub(crate) fn get_mut(&mut self, key: u64) -> Option<&mut DiscardCmd> {
        self.cmds.get_mut(&key)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &DiscardCmd> {
        self.cmds.values()
    }

    /// Key of the command covering `addr`.
    pub(crate) fn covering(&self, addr: u64) -> Option<u64> {
        self.cmds
            .range(..=addr)
            .next_back()
            .filter(|(_, cmd)| cmd.covers(addr))
            .map(|(&key, _)| key)
    }

    /// Keys of commands intersecting `[start, end)`, ascending.
    pub(crate) fn overlapping(&self, start: u64, end: u64) -> Vec<u64> {
        if start >= end {
            return Vec::new();
        }
        let first = self.covering(start).unwrap_or(start);
        self.cmds
            .range(first..end)
            .filter(|(_, cmd)| cmd.end() > start)
            .map(|(&key, _)| key)
            .collect()
    }

    /// Keys queued in `bucket`, oldest first.
    pub(crate) fn bucket(&self, bucket: usize) -> Vec<u64> {
        self.pending[bucket].values().copied().collect()
    }

    #[cfg(test)]
    pub(crate) fn bucket_len(&self, bucket: usize) -> usize {
        self.pending[bucket].len()
    }

    fn first_after(&self, key: u64) -> Option<u64> {
        self.cmds
            .range(key.saturating_add(1)..)
            .next()
            .map(|(&k, _)| k)
    }

    fn link(&mut self, key: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(cmd) = self.cmds.get_mut(&key) {
            cmd.seq = Some(seq);
            self.queued_blocks += cmd.len;
            self.pending[bucket_of(cmd.len)].insert(seq, key);
        }
    }

    fn unlink(&mut self, key: u64) {
        if let Some(cmd) = self.cmds.get_mut(&key) {
            if let Some(seq) = cmd.seq.take() {
                self.pending[bucket_of(cmd.len)].remove(&seq);
                self.queued_blocks -= cmd.len;
            }
        }
    }

    /// Insert a fresh Prepared command. The range must be free.
    fn insert(&mut self, ext: Extent) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.cmds.insert(
            ext.lstart,
            DiscardCmd {
                id,
                lstart: ext.lstart,
                start: ext.start,
                len: ext.len,
                state: CmdState::Prepared,
                waiters: 0,
                inflight: 0,
                error: None,
                seq: None,
            },
        );
        self.link(ext.lstart);
        id
    }

    /// Detach a command from the tree and, if Prepared, from its bucket.
    pub(crate) fn remove(&mut self, key: u64) -> Option<DiscardCmd> {
        self.unlink(key);
        self.cmds.remove(&key)
    }

    /// Take a Prepared command out of its bucket ahead of submission.
    pub(crate) fn begin_submit(&mut self, key: u64) {
        self.unlink(key);
    }

    /// `piece` directly follows the Prepared command at `key`.
    fn mergeable(&self, key: u64, piece: Extent, max_len: u64) -> bool {
        self.cmds.get(&key).is_some_and(|back| {
            back.state == CmdState::Prepared
                && back.end() == piece.lstart
                && back.start + back.len == piece.start
                && back.len + piece.len <= max_len
        })
    }

    /// `piece` directly precedes the Prepared command at `key`.
    fn mergeable_front(&self, piece: Extent, key: u64, max_len: u64) -> bool {
        self.cmds.get(&key).is_some_and(|front| {
            front.state == CmdState::Prepared
                && piece.end() == front.lstart
                && piece.start + piece.len == front.start
                && piece.len + front.len <= max_len
        })
    }

    /// Queue `[lstart, lstart + len)`, filling only the gaps between
    /// existing commands and merging into Prepared neighbours while the
    /// merged length stays within `max_len`.
    pub(crate) fn queue_range(&mut self, lstart: u64, start: u64, len: u64, max_len: u64) {
        if len == 0 {
            return;
        }
        let end = lstart + len;
        let mut prev = self.cmds.range(..=lstart).next_back().map(|(&k, _)| k);
        let mut next = self.first_after(lstart);
        let mut piece = Extent {
            lstart,
            start,
            len: next.map_or(len, |n| (n - lstart).min(len)),
        };

        loop {
            if let Some(p) = prev {
                let gap_start = self.cmds[&p].end().max(lstart);
                if gap_start >= end {
                    break;
                }
                let gap_end = match next {
                    Some(n) if n <= end => n,
                    _ => end,
                };
                piece = Extent {
                    lstart: gap_start,
                    start: start + (gap_start - lstart),
                    len: gap_end.saturating_sub(gap_start),
                };
            }

            if piece.len > 0 {
                let mut merged = false;
                let mut absorbed = None;

                if let Some(p) = prev.filter(|&p| self.mergeable(p, piece, max_len)) {
                    self.unlink(p);
                    let back = self.cmds.get_mut(&p).map_or(piece, |back| {
                        back.len += piece.len;
                        Extent {
                            lstart: back.lstart,
                            start: back.start,
                            len: back.len,
                        }
                    });
                    self.link(p);
                    piece = back;
                    absorbed = Some(p);
                    merged = true;
                }

                if let Some(n) = next.filter(|&n| self.mergeable_front(piece, n, max_len)) {
                    if let Some(a) = absorbed {
                        self.remove(a);
                    }
                    self.unlink(n);
                    if let Some(mut front) = self.cmds.remove(&n) {
                        front.lstart = piece.lstart;
                        front.start = piece.start;
                        front.len += piece.len;
                        self.cmds.insert(piece.lstart, front);
                        self.link(piece.lstart);
                    }
                    next = Some(piece.lstart);
                    merged = true;
                }

                if !merged {
                    self.insert(piece);
                }
            }

            prev = next;
            let Some(p) = prev else { break };
            next = self.first_after(p);
        }
    }

    /// Carve `addr` out of the Prepared or Done command at `key`.
    pub(crate) fn punch(&mut self, key: u64, addr: u64) {
        let Some(cmd) = self.cmds.get(&key) else {
            return;
        };
        if !cmd.covers(addr) {
            return;
        }
        let whole_drop = cmd.state == CmdState::Done || cmd.len == 1;
        if whole_drop {
            if cmd.waiters == 0 {
                self.remove(key);
            }
            return;
        }
        if cmd.state != CmdState::Prepared {
            return;
        }
        let Some(cmd) = self.remove(key) else {
            return;
        };
        let end = cmd.end();
        if addr > cmd.lstart {
            self.insert(Extent {
                lstart: cmd.lstart,
                start: cmd.start,
                len: addr - cmd.lstart,
            });
        }
        if addr + 1 < end {
            self.insert(Extent {
                lstart: addr + 1,
                start: cmd.start + (addr + 1 - cmd.lstart),
                len: end - addr - 1,
            });
        }
    }

    /// Remove every Prepared command. Returns how many were dropped.
    pub(crate) fn drop_prepared(&mut self) -> usize {
        let keys: Vec<u64> = self
            .pending
            .iter()
            .flat_map(|bucket| bucket.values().copied())
            .collect();
        for &key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    /// `(lstart, len, state)` of every command in key order.
    #[cfg(test)]
    pub(crate) fn shape(&self) -> Vec<(u64, u64, CmdState)> {
        self.cmds
            .values()
            .map(|c| (c.lstart, c.len, c.state))
            .collect()
    }
}
