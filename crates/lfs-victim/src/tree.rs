//! Transient mtime-ordered candidate tree for the age-based policies.

use lfs_types::SegmentNo;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Candidates keyed by `(mtime, insertion order)`; equal mtimes keep scan
/// order.
#[derive(Debug, Default)]
pub struct VictimTree {
    entries: BTreeMap<(u64, u32), SegmentNo>,
    seq: u32,
}

impl VictimTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mtime: u64, seg: SegmentNo) {
        self.entries.insert((mtime, self.seq), seg);
        self.seq += 1;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest first.
    pub fn by_age(&self) -> impl Iterator<Item = (u64, SegmentNo)> + '_ {
        self.entries.iter().map(|(&(mtime, _), &seg)| (mtime, seg))
    }

    /// Entries at or before `mtime`, nearest first.
    pub fn older_from(&self, mtime: u64) -> impl Iterator<Item = (u64, SegmentNo)> + '_ {
        self.entries
            .range(..=(mtime, u32::MAX))
            .rev()
            .map(|(&(m, _), &seg)| (m, seg))
    }

    /// Entries strictly after `mtime`, nearest first.
    pub fn newer_than(&self, mtime: u64) -> impl Iterator<Item = (u64, SegmentNo)> + '_ {
        self.entries
            .range((Bound::Excluded((mtime, u32::MAX)), Bound::Unbounded))
            .map(|(&(m, _), &seg)| (m, seg))
    }
}
