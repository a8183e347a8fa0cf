#![forbid(unsafe_code)]
//! Shared types for the log-structured segment manager.
//!
//! Addresses, segment/section/zone numbers, the segment kind taxonomy, and
//! the validated [`Geometry`] that every other crate derives its arithmetic
//! from.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of write-head kinds, including the relocation staging kind.
pub const NR_KINDS: usize = 7;

/// Maximum number of sections scanned on each side of the middle when
/// spreading allocations from the center of the main area.
pub const SPREAD_RADIUS_SECTIONS: u32 = 8;

// ── Addresses ───────────────────────────────────────────────────────────────

/// Absolute block address on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockAddr(pub u64);

impl BlockAddr {
    /// No block: the owner has never been written.
    pub const NULL: Self = Self(0);
    /// Reserved, not yet written. Invalidating it is a no-op.
    pub const NEW: Self = Self(u64::MAX);

    #[must_use]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    #[must_use]
    pub fn is_new(self) -> bool {
        self == Self::NEW
    }

    #[must_use]
    pub fn checked_add(self, blocks: u64) -> Option<Self> {
        self.0.checked_add(blocks).map(Self)
    }
}

impl fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Segment index within the main area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentNo(pub u32);

impl SegmentNo {
    pub const NULL: Self = Self(u32::MAX);

    #[must_use]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SegmentNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("seg:null")
        } else {
            write!(f, "seg:{}", self.0)
        }
    }
}

/// Section index: `segs_per_sec` contiguous segments reclaimed as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectionNo(pub u32);

impl SectionNo {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SectionNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sec:{}", self.0)
    }
}

/// Zone index: `secs_per_zone` contiguous sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneNo(pub u32);

/// Reference to the object that owns a live block, as reported by the
/// filesystem layer above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Owning object (inode or node id).
    pub owner: u64,
    /// Offset of the block within the owner.
    pub offset: u64,
}

// ── Kinds ───────────────────────────────────────────────────────────────────

/// Temperature/class of a segment, one write head per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegKind {
    HotData,
    WarmData,
    ColdData,
    HotNode,
    WarmNode,
    ColdNode,
    /// Relocation staging for age-threshold garbage collection.
    Fragment,
}

impl SegKind {
    pub const ALL: [Self; NR_KINDS] = [
        Self::HotData,
        Self::WarmData,
        Self::ColdData,
        Self::HotNode,
        Self::WarmNode,
        Self::ColdNode,
        Self::Fragment,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn from_index(idx: usize) -> Option<Self> {
        Self::ALL.get(idx).copied()
    }

    /// Data kinds, including the relocation staging kind.
    #[must_use]
    pub fn is_data(self) -> bool {
        matches!(
            self,
            Self::HotData | Self::WarmData | Self::ColdData | Self::Fragment
        )
    }

    #[must_use]
    pub fn is_node(self) -> bool {
        !self.is_data()
    }

    #[must_use]
    pub fn is_hot(self) -> bool {
        matches!(self, Self::HotData | Self::HotNode)
    }

    /// Coldest kind of the same class; relocation destination.
    #[must_use]
    pub fn cold_of_class(self) -> Self {
        if self.is_data() {
            Self::ColdData
        } else {
            Self::ColdNode
        }
    }

    /// Kinds sharing this kind's class, in `Hot, Warm, Cold` order.
    #[must_use]
    pub fn class_members(self) -> [Self; 3] {
        if self.is_data() {
            [Self::HotData, Self::WarmData, Self::ColdData]
        } else {
            [Self::HotNode, Self::WarmNode, Self::ColdNode]
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HotData => "hot_data",
            Self::WarmData => "warm_data",
            Self::ColdData => "cold_data",
            Self::HotNode => "hot_node",
            Self::WarmNode => "warm_node",
            Self::ColdNode => "cold_node",
            Self::Fragment => "fragment",
        }
    }
}

impl fmt::Display for SegKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Modes and policies ──────────────────────────────────────────────────────

/// Whether a collection pass runs opportunistically or on behalf of a
/// blocked writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcType {
    Background,
    Foreground,
}

/// Scoring policy used to rank reclaim candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VictimPolicy {
    Greedy,
    CostBenefit,
    AgeThreshold,
}

impl VictimPolicy {
    pub const COUNT: usize = 3;

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// How a write head consumes its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocMode {
    /// Append-only into a free segment.
    Lfs,
    /// Slot reuse: fill holes of a dirty segment.
    Ssr,
    /// Slot reuse choosing a segment of similar age to the source.
    AgeSsr,
}

/// Volume-wide collection mode, set by the administrator surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcMode {
    #[default]
    Normal,
    IdleCb,
    IdleGreedy,
    IdleAt,
    Urgent,
}

/// Cell mode of a flash section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashMode {
    Slc,
    Tlc,
}

/// Direction in which free sections are searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocDirection {
    TowardZero,
    TowardMax,
    SpreadFromCenter,
}

/// Caller preference for how a block should be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocDiscipline {
    /// Slot reuse only when free space is short.
    #[default]
    Auto,
    /// Never adopt a dirty segment.
    Append,
    /// Prefer adopting a dirty segment whenever one is available.
    SlotReuse,
}

// ── Geometry ────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
    #[error("main_segments ({main_segments}) is not a multiple of segs_per_sec ({segs_per_sec})")]
    UnalignedSections { main_segments: u32, segs_per_sec: u32 },
    #[error("main area start must be above block 0")]
    MainAtNull,
    #[error("slc_segs_per_sec ({slc}) must be below segs_per_sec ({segs_per_sec})")]
    SlcTooLarge { slc: u32, segs_per_sec: u32 },
    #[error("reserved segments ({reserved}) exceed overprovisioned segments ({ovp})")]
    ReservedAboveOvp { reserved: u32, ovp: u32 },
    #[error("main area does not fit in the block address space")]
    Overflow,
}

/// Layout of the main (segment-managed) area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub blocks_per_seg: u32,
    pub segs_per_sec: u32,
    pub secs_per_zone: u32,
    /// First block of segment 0.
    pub main_blkaddr: u64,
    pub main_segments: u32,
    /// Segments held back for checkpoint-time relocation.
    pub reserved_segments: u32,
    /// Overprovisioned segments (includes the reserved ones).
    pub overprov_segments: u32,
    /// Leading segments of each section written in SLC mode; 0 disables.
    pub slc_segs_per_sec: u32,
}

impl Geometry {
    pub fn validate(&self) -> Result<(), GeometryError> {
        for (field, value) in [
            ("blocks_per_seg", self.blocks_per_seg),
            ("segs_per_sec", self.segs_per_sec),
            ("secs_per_zone", self.secs_per_zone),
            ("main_segments", self.main_segments),
        ] {
            if value == 0 {
                return Err(GeometryError::Zero { field });
            }
        }
        if self.main_segments % self.segs_per_sec != 0 {
            return Err(GeometryError::UnalignedSections {
                main_segments: self.main_segments,
                segs_per_sec: self.segs_per_sec,
            });
        }
        if self.main_blkaddr == 0 {
            return Err(GeometryError::MainAtNull);
        }
        if self.slc_segs_per_sec >= self.segs_per_sec && self.slc_segs_per_sec != 0 {
            return Err(GeometryError::SlcTooLarge {
                slc: self.slc_segs_per_sec,
                segs_per_sec: self.segs_per_sec,
            });
        }
        if self.reserved_segments > self.overprov_segments {
            return Err(GeometryError::ReservedAboveOvp {
                reserved: self.reserved_segments,
                ovp: self.overprov_segments,
            });
        }
        let blocks = u64::from(self.main_segments) * u64::from(self.blocks_per_seg);
        if self.main_blkaddr.checked_add(blocks).is_none_or(|end| end == u64::MAX) {
            return Err(GeometryError::Overflow);
        }
        Ok(())
    }

    #[must_use]
    pub fn main_sections(&self) -> u32 {
        self.main_segments / self.segs_per_sec
    }

    #[must_use]
    pub fn blocks_per_sec(&self) -> u64 {
        u64::from(self.blocks_per_seg) * u64::from(self.segs_per_sec)
    }

    #[must_use]
    pub fn main_blocks(&self) -> u64 {
        u64::from(self.main_segments) * u64::from(self.blocks_per_seg)
    }

    #[must_use]
    pub fn reserved_sections(&self) -> u32 {
        self.reserved_segments / self.segs_per_sec
    }

    #[must_use]
    pub fn overprov_sections(&self) -> u32 {
        self.overprov_segments / self.segs_per_sec
    }

    #[must_use]
    pub fn start_block(&self, seg: SegmentNo) -> BlockAddr {
        BlockAddr(self.main_blkaddr + u64::from(seg.0) * u64::from(self.blocks_per_seg))
    }

    /// Whether `addr` lies inside the main area.
    #[must_use]
    pub fn contains(&self, addr: BlockAddr) -> bool {
        addr.0 >= self.main_blkaddr && addr.0 - self.main_blkaddr < self.main_blocks()
    }

    /// Segment holding `addr`, or `None` outside the main area.
    #[must_use]
    pub fn segment_of(&self, addr: BlockAddr) -> Option<SegmentNo> {
        if !self.contains(addr) {
            return None;
        }
        let seg = (addr.0 - self.main_blkaddr) / u64::from(self.blocks_per_seg);
        u32::try_from(seg).ok().map(SegmentNo)
    }

    /// Offset of `addr` within its segment. Caller checks `contains` first.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn block_offset(&self, addr: BlockAddr) -> u32 {
        // Remainder of a division by a u32 always fits in u32.
        ((addr.0 - self.main_blkaddr) % u64::from(self.blocks_per_seg)) as u32
    }

    #[must_use]
    pub fn section_of(&self, seg: SegmentNo) -> SectionNo {
        SectionNo(seg.0 / self.segs_per_sec)
    }

    #[must_use]
    pub fn first_segment(&self, sec: SectionNo) -> SegmentNo {
        SegmentNo(sec.0 * self.segs_per_sec)
    }

    #[must_use]
    pub fn zone_of(&self, sec: SectionNo) -> ZoneNo {
        ZoneNo(sec.0 / self.secs_per_zone)
    }

    #[must_use]
    pub fn main_zones(&self) -> u32 {
        self.main_sections().div_ceil(self.secs_per_zone)
    }
}

impl Default for Geometry {
    /// 2 MiB segments of 4 KiB blocks, one segment per section, 1 GiB main area.
    fn default() -> Self {
        Self {
            blocks_per_seg: 512,
            segs_per_sec: 1,
            secs_per_zone: 1,
            main_blkaddr: 0x1000,
            main_segments: 512,
            reserved_segments: 12,
            overprov_segments: 24,
            slc_segs_per_sec: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> Geometry {
        Geometry {
            blocks_per_seg: 512,
            segs_per_sec: 4,
            secs_per_zone: 2,
            main_blkaddr: 1024,
            main_segments: 64,
            reserved_segments: 8,
            overprov_segments: 16,
            slc_segs_per_sec: 0,
        }
    }

    #[test]
    fn address_arithmetic() {
        let g = geo();
        assert_eq!(g.start_block(SegmentNo(0)), BlockAddr(1024));
        assert_eq!(g.start_block(SegmentNo(3)), BlockAddr(1024 + 3 * 512));
        assert_eq!(g.segment_of(BlockAddr(1024 + 513)), Some(SegmentNo(1)));
        assert_eq!(g.block_offset(BlockAddr(1024 + 513)), 1);
        assert_eq!(g.segment_of(BlockAddr(1023)), None);
        assert_eq!(g.segment_of(BlockAddr(1024 + 64 * 512)), None);
        assert_eq!(g.section_of(SegmentNo(7)), SectionNo(1));
        assert_eq!(g.first_segment(SectionNo(2)), SegmentNo(8));
        assert_eq!(g.zone_of(SectionNo(3)), ZoneNo(1));
        assert_eq!(g.main_sections(), 16);
        assert_eq!(g.main_zones(), 8);
        assert_eq!(g.blocks_per_sec(), 2048);
        assert_eq!(g.reserved_sections(), 2);
        assert_eq!(g.overprov_sections(), 4);
    }

    #[test]
    fn validate_rejects_bad_layouts() {
        assert_eq!(geo().validate(), Ok(()));

        let mut g = geo();
        g.blocks_per_seg = 0;
        assert_eq!(
            g.validate(),
            Err(GeometryError::Zero {
                field: "blocks_per_seg"
            })
        );

        let mut g = geo();
        g.main_segments = 63;
        assert!(matches!(
            g.validate(),
            Err(GeometryError::UnalignedSections { .. })
        ));

        let mut g = geo();
        g.main_blkaddr = 0;
        assert_eq!(g.validate(), Err(GeometryError::MainAtNull));

        let mut g = geo();
        g.slc_segs_per_sec = 4;
        assert!(matches!(g.validate(), Err(GeometryError::SlcTooLarge { .. })));

        let mut g = geo();
        g.reserved_segments = 17;
        assert!(matches!(
            g.validate(),
            Err(GeometryError::ReservedAboveOvp { .. })
        ));
    }

    #[test]
    fn kind_classes() {
        assert!(SegKind::Fragment.is_data());
        assert!(SegKind::WarmNode.is_node());
        assert_eq!(SegKind::HotData.cold_of_class(), SegKind::ColdData);
        assert_eq!(SegKind::HotNode.cold_of_class(), SegKind::ColdNode);
        assert_eq!(
            SegKind::WarmNode.class_members(),
            [SegKind::HotNode, SegKind::WarmNode, SegKind::ColdNode]
        );
        for (idx, kind) in SegKind::ALL.iter().enumerate() {
            assert_eq!(SegKind::from_index(idx), Some(*kind));
        }
        assert_eq!(SegKind::from_index(NR_KINDS), None);
    }

    #[test]
    fn special_addresses() {
        assert!(BlockAddr::NULL.is_null());
        assert!(BlockAddr::NEW.is_new());
        assert_eq!(BlockAddr::NEW.checked_add(1), None);
        assert_eq!(SegmentNo::NULL.to_string(), "seg:null");
        assert_eq!(SegmentNo(3).to_string(), "seg:3");
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&SegKind::WarmData).expect("serialize");
        assert_eq!(json, "\"warm_data\"");
        let mode: GcMode = serde_json::from_str("\"idle_at\"").expect("deserialize");
        assert_eq!(mode, GcMode::IdleAt);
    }
}
