//! Flash cell mode for newly opened sections.
//!
//! While free space is plentiful new sections are written in the fast SLC
//! mode. As free space shrinks SLC is restricted to hot kinds, then to hot
//! data, then switched off. Once off it stays off until free space climbs
//! `slc_enable_interval` sections above L3.

use lfs_segment::GcLevels;
use lfs_types::{FlashMode, SegKind};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Which kinds may get SLC sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlcBand {
    All,
    Hot,
    HotData,
    None,
}

impl SlcBand {
    #[must_use]
    pub fn mode_for(self, kind: SegKind) -> FlashMode {
        let slc = match self {
            Self::All => true,
            Self::Hot => kind.is_hot(),
            Self::HotData => kind == SegKind::HotData,
            Self::None => false,
        };
        if slc { FlashMode::Slc } else { FlashMode::Tlc }
    }
}

/// Band chooser with the "closed" latch.
#[derive(Debug, Default)]
pub struct FlashModeChooser {
    closed: AtomicBool,
}

impl FlashModeChooser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Band for `free_secs`, updating the latch.
    pub fn band(&self, free_secs: u32, levels: &GcLevels, enable_interval: u32) -> SlcBand {
        if free_secs > levels.l1 {
            self.closed.store(false, Ordering::Release);
            return SlcBand::All;
        }
        if free_secs > levels.l2 {
            self.closed.store(false, Ordering::Release);
            return SlcBand::Hot;
        }
        let midpoint = levels.l3 - levels.l3.saturating_sub(levels.l5) / 2;
        if free_secs < midpoint {
            self.closed.store(true, Ordering::Release);
            return SlcBand::None;
        }
        let reopen = if self.is_closed() {
            levels.l3.saturating_add(enable_interval)
        } else {
            midpoint
        };
        if free_secs >= reopen {
            self.closed.store(false, Ordering::Release);
            SlcBand::HotData
        } else {
            SlcBand::None
        }
    }
}
