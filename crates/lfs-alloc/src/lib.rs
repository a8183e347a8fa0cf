#![forbid(unsafe_code)]
//! Segment allocation for writers and the garbage collector.
//!
//! Every segment kind has one write head. A head appends into a free
//! segment (LFS) or refills the holes of a dirty one (slot reuse, SSR).
//! When a head runs out of room it switches segments following a fixed
//! rule order; see [`SegmentAllocator`].
//!
//! ## Design
//!
//! 1. **WriteHead**: the per-kind cursor, persisted as a `HeadCursor`.
//! 2. **AllocationStrategy**: where fresh segments are searched for.
//! 3. **FlashModeChooser**: SLC/TLC mode for newly opened sections.
//! 4. **SegmentAllocator**: the switch rules, slot-reuse search and block
//!    placement.

pub mod allocator;
pub mod flash;
pub mod head;
pub mod strategy;

pub use allocator::{AllocStats, FrozenHeads, SegmentAllocator};
pub use flash::{FlashModeChooser, SlcBand};
pub use head::WriteHead;
pub use strategy::{
    AllocationStrategy, ClassicStrategy, Placement, PlacementView, SpreadStrategy, StrategyKind,
    strategy_for,
};

use lfs_error::{LfsError, Result};
use lfs_segment::{DirtyMetaSections, GcLevels};
use lfs_types::{GcMode, Geometry};
use serde::{Deserialize, Serialize};

/// Allocator tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocConfig {
    /// Never adopt dirty segments, whatever the caller asks for.
    ///
    /// Default: false.
    pub lfs_only: bool,
    /// Grow every kind toward the end of the main area.
    ///
    /// Default: false.
    pub no_heap: bool,
    /// Free sections, on top of the reserved ones, below which `Auto`
    /// allocations turn to slot reuse.
    ///
    /// Default: none (the reserved section count).
    pub min_ssr_sections: Option<u32>,
    /// Write leading segments of new sections in SLC mode when the
    /// geometry has any.
    ///
    /// Default: true.
    pub slc_mode: bool,
    /// Sections above L3 free space needs to reach before SLC re-opens
    /// after it was switched off.
    ///
    /// Default: 4.
    pub slc_enable_interval: u32,
    pub strategy: StrategyKind,
}

impl Default for AllocConfig {
    fn default() -> Self {
        Self {
            lfs_only: false,
            no_heap: false,
            min_ssr_sections: None,
            slc_mode: true,
            slc_enable_interval: 4,
            strategy: StrategyKind::Classic,
        }
    }
}

impl AllocConfig {
    pub fn validate(&self, geo: &Geometry) -> Result<()> {
        if let Some(min) = self.min_ssr_sections {
            if min >= geo.main_sections() {
                return Err(LfsError::Config(format!(
                    "min_ssr_sections {min} must be below the {} main sections",
                    geo.main_sections()
                )));
            }
        }
        if self.slc_enable_interval >= geo.main_sections() {
            return Err(LfsError::Config(format!(
                "slc_enable_interval {} must be below the {} main sections",
                self.slc_enable_interval,
                geo.main_sections()
            )));
        }
        Ok(())
    }
}

/// Volume-wide inputs that change at runtime and steer slot reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tuning {
    pub gc_mode: GcMode,
    pub levels: GcLevels,
    pub dirty_meta: DirtyMetaSections,
}

impl Tuning {
    #[must_use]
    pub fn new(levels: GcLevels) -> Self {
        Self {
            gc_mode: GcMode::Normal,
            levels,
            dirty_meta: DirtyMetaSections::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_and_partial_json() {
        let config = AllocConfig::default();
        config.validate(&Geometry::default()).expect("valid");
        let parsed: AllocConfig =
            serde_json::from_str(r#"{"strategy":"spread","lfs_only":true}"#).expect("parse");
        assert_eq!(parsed.strategy, StrategyKind::Spread);
        assert!(parsed.lfs_only);
        assert_eq!(parsed.slc_enable_interval, 4);
        assert_eq!(parsed.min_ssr_sections, None);
    }

    #[test]
    fn config_rejects_out_of_range_sections() {
        let geo = Geometry::default();
        let bad = AllocConfig {
            min_ssr_sections: Some(geo.main_sections()),
            ..AllocConfig::default()
        };
        assert!(matches!(bad.validate(&geo), Err(LfsError::Config(_))));
        let bad = AllocConfig {
            slc_enable_interval: 10_000,
            ..AllocConfig::default()
        };
        assert!(bad.validate(&geo).is_err());
    }
}
