//! Placement strategies for newly opened segments.
//!
//! A strategy answers one question when a write head needs a fresh segment:
//! where to start searching the free map, and in which direction. It is
//! chosen once when the volume is opened.

use lfs_types::{AllocDirection, Geometry, SegKind, SegmentNo};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Classic,
    Spread,
}

/// Volume state a strategy may look at.
#[derive(Debug, Clone, Copy)]
pub struct PlacementView {
    pub geo: Geometry,
    pub checkpoint_disabled: bool,
    /// Slot-reuse scan cursor; 0 when unset.
    pub alloc_next: u32,
}

/// Where a section search starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub hint: SegmentNo,
    pub direction: AllocDirection,
}

pub trait AllocationStrategy: Send + Sync + fmt::Debug {
    fn kind(&self) -> StrategyKind;

    /// Search start for a head of `kind` currently at `current`.
    fn placement(&self, kind: SegKind, current: SegmentNo, view: &PlacementView) -> Placement;

    /// Whether an append head moving on to the next free segment of its
    /// section opens a new section instead.
    fn new_section_on_next_free(&self) -> bool {
        false
    }
}

/// Build the strategy for `kind`.
#[must_use]
pub fn strategy_for(kind: StrategyKind, no_heap: bool) -> Box<dyn AllocationStrategy> {
    match kind {
        StrategyKind::Classic => Box::new(ClassicStrategy { no_heap }),
        StrategyKind::Spread => Box::new(SpreadStrategy),
    }
}

/// Warm and cold data grow toward the end of the main area, everything
/// else toward the start, so hot and cold data keep apart.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassicStrategy {
    /// Every kind grows toward the end.
    pub no_heap: bool,
}

impl ClassicStrategy {
    fn hint(&self, kind: SegKind, current: SegmentNo, view: &PlacementView) -> SegmentNo {
        // Multi-segment sections keep filling the current section first.
        if view.geo.segs_per_sec > 1 {
            return current;
        }
        if view.checkpoint_disabled {
            return SegmentNo(0);
        }
        if self.no_heap && (kind == SegKind::HotData || kind.is_node()) {
            return SegmentNo(0);
        }
        if view.alloc_next != 0 {
            return SegmentNo(view.alloc_next);
        }
        current
    }
}

impl AllocationStrategy for ClassicStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Classic
    }

    fn placement(&self, kind: SegKind, current: SegmentNo, view: &PlacementView) -> Placement {
        let direction = if self.no_heap || matches!(kind, SegKind::WarmData | SegKind::ColdData) {
            AllocDirection::TowardMax
        } else {
            AllocDirection::TowardZero
        };
        Placement {
            hint: self.hint(kind, current, view),
            direction,
        }
    }
}

/// Subdivides the main area by temperature: hot kinds from the start, warm
/// data from the middle outward, cold kinds from the end.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpreadStrategy;

impl AllocationStrategy for SpreadStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Spread
    }

    fn placement(&self, kind: SegKind, _current: SegmentNo, view: &PlacementView) -> Placement {
        let last = SegmentNo(view.geo.main_segments.saturating_sub(1));
        let (hint, direction) = match kind {
            SegKind::HotNode | SegKind::WarmNode | SegKind::HotData | SegKind::Fragment => {
                (SegmentNo(0), AllocDirection::TowardMax)
            }
            SegKind::WarmData => (SegmentNo(0), AllocDirection::SpreadFromCenter),
            SegKind::ColdNode | SegKind::ColdData => (last, AllocDirection::TowardZero),
        };
        Placement { hint, direction }
    }

    fn new_section_on_next_free(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(segs_per_sec: u32, alloc_next: u32, checkpoint_disabled: bool) -> PlacementView {
        PlacementView {
            geo: Geometry {
                segs_per_sec,
                main_segments: 64,
                ..Geometry::default()
            },
            checkpoint_disabled,
            alloc_next,
        }
    }

    #[test]
    fn classic_directions() {
        let s = ClassicStrategy::default();
        let v = view(1, 0, false);
        let dir = |k| s.placement(k, SegmentNo(5), &v).direction;
        assert_eq!(dir(SegKind::WarmData), AllocDirection::TowardMax);
        assert_eq!(dir(SegKind::ColdData), AllocDirection::TowardMax);
        assert_eq!(dir(SegKind::HotData), AllocDirection::TowardZero);
        assert_eq!(dir(SegKind::HotNode), AllocDirection::TowardZero);
        assert_eq!(dir(SegKind::ColdNode), AllocDirection::TowardZero);
        assert_eq!(dir(SegKind::Fragment), AllocDirection::TowardZero);

        let no_heap = ClassicStrategy { no_heap: true };
        for kind in SegKind::ALL {
            assert_eq!(
                no_heap.placement(kind, SegmentNo(5), &v).direction,
                AllocDirection::TowardMax
            );
        }
    }

    #[test]
    fn classic_hints() {
        let s = ClassicStrategy::default();
        let hint = |v: &PlacementView| s.placement(SegKind::WarmData, SegmentNo(5), v).hint;
        assert_eq!(hint(&view(1, 0, false)), SegmentNo(5));
        assert_eq!(hint(&view(1, 9, false)), SegmentNo(9));
        assert_eq!(hint(&view(1, 9, true)), SegmentNo(0));
        assert_eq!(hint(&view(4, 9, true)), SegmentNo(5), "sections keep the current hint");

        let no_heap = ClassicStrategy { no_heap: true };
        let v = view(1, 9, false);
        assert_eq!(no_heap.placement(SegKind::HotData, SegmentNo(5), &v).hint, SegmentNo(0));
        assert_eq!(no_heap.placement(SegKind::ColdNode, SegmentNo(5), &v).hint, SegmentNo(0));
        assert_eq!(no_heap.placement(SegKind::ColdData, SegmentNo(5), &v).hint, SegmentNo(9));
    }

    #[test]
    fn spread_directions_are_absolute() {
        let s = SpreadStrategy;
        let v = view(1, 9, false);
        let place = |k| s.placement(k, SegmentNo(30), &v);
        assert_eq!(
            place(SegKind::HotData),
            Placement {
                hint: SegmentNo(0),
                direction: AllocDirection::TowardMax
            }
        );
        assert_eq!(place(SegKind::WarmNode).direction, AllocDirection::TowardMax);
        assert_eq!(place(SegKind::WarmData).direction, AllocDirection::SpreadFromCenter);
        assert_eq!(
            place(SegKind::ColdData),
            Placement {
                hint: SegmentNo(63),
                direction: AllocDirection::TowardZero
            }
        );
        assert_eq!(place(SegKind::ColdNode).hint, SegmentNo(63));
        assert!(s.new_section_on_next_free());
        assert!(!ClassicStrategy::default().new_section_on_next_free());
    }

    #[test]
    fn factory_honours_kind() {
        assert_eq!(strategy_for(StrategyKind::Classic, false).kind(), StrategyKind::Classic);
        assert_eq!(strategy_for(StrategyKind::Spread, true).kind(), StrategyKind::Spread);
    }
}
