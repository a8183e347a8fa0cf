//! Write heads: one append/slot-reuse cursor per segment kind.

use lfs_block::{HeadCursor, SegmentSummary};
use lfs_types::{AllocMode, SegKind, SegmentNo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteHead {
    kind: SegKind,
    segno: SegmentNo,
    next_blkoff: u32,
    alloc_mode: AllocMode,
    /// Blocks placed since the head entered `segno`.
    placed: u32,
}

impl WriteHead {
    /// A head that has not opened a segment yet.
    #[must_use]
    pub fn closed(kind: SegKind) -> Self {
        Self {
            kind,
            segno: SegmentNo::NULL,
            next_blkoff: 0,
            alloc_mode: AllocMode::Lfs,
            placed: 0,
        }
    }

    #[must_use]
    pub fn from_cursor(cursor: &HeadCursor) -> Self {
        Self {
            kind: cursor.kind,
            segno: cursor.segno,
            next_blkoff: cursor.next_blkoff,
            alloc_mode: cursor.alloc_mode,
            placed: 0,
        }
    }

    #[must_use]
    pub fn kind(&self) -> SegKind {
        self.kind
    }

    #[must_use]
    pub fn segno(&self) -> SegmentNo {
        self.segno
    }

    #[must_use]
    pub fn next_blkoff(&self) -> u32 {
        self.next_blkoff
    }

    #[must_use]
    pub fn alloc_mode(&self) -> AllocMode {
        self.alloc_mode
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.segno.is_null()
    }

    /// Open with room left in a segment of `blocks_per_seg` blocks.
    #[must_use]
    pub fn has_space(&self, blocks_per_seg: u32) -> bool {
        self.is_open() && self.next_blkoff < blocks_per_seg
    }

    pub(crate) fn enter(&mut self, segno: SegmentNo, next_blkoff: u32, mode: AllocMode) {
        self.segno = segno;
        self.next_blkoff = next_blkoff;
        self.alloc_mode = mode;
        self.placed = 0;
    }

    pub(crate) fn advance(&mut self, next_blkoff: u32) {
        self.next_blkoff = next_blkoff;
        self.placed += 1;
    }

    #[must_use]
    pub fn cursor(&self) -> HeadCursor {
        HeadCursor {
            kind: self.kind,
            segno: self.segno,
            next_blkoff: self.next_blkoff,
            alloc_mode: self.alloc_mode,
        }
    }

    #[must_use]
    pub fn summary(&self) -> SegmentSummary {
        SegmentSummary {
            segno: self.segno,
            kind: self.kind,
            next_blkoff: self.next_blkoff,
            alloc_mode: self.alloc_mode,
        }
    }

    #[must_use]
    pub fn placed(&self) -> u32 {
        self.placed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_head_has_no_space() {
        let head = WriteHead::closed(SegKind::HotData);
        assert!(!head.is_open());
        assert!(!head.has_space(512));
    }

    #[test]
    fn cursor_round_trips() {
        let mut head = WriteHead::closed(SegKind::ColdNode);
        head.enter(SegmentNo(7), 3, AllocMode::Ssr);
        head.advance(9);
        assert_eq!(head.placed(), 1);
        let restored = WriteHead::from_cursor(&head.cursor());
        assert_eq!(restored.segno(), SegmentNo(7));
        assert_eq!(restored.next_blkoff(), 9);
        assert_eq!(restored.alloc_mode(), AllocMode::Ssr);
        assert!(restored.has_space(10));
        assert!(!restored.has_space(9));
        assert_eq!(head.summary().kind, SegKind::ColdNode);
    }
}
