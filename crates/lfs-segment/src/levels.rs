//! Free-space pressure bands.
//!
//! Six free-section thresholds `L1 > L2 > ... > L6` split the volume into
//! bands. Each band carries the background GC cadence and aggressiveness;
//! the pressure level reported to callers is the band index, or 6 when
//! foreground GC is required.

use lfs_error::{LfsError, Result};
use lfs_types::Geometry;
use serde::{Deserialize, Serialize};

/// Base wait unit for the band table, in milliseconds.
pub const MIN_WT_MS: u64 = 1000;

const WEAK_IOLIMIT: u32 = 4;
const STRONG_IOLIMIT: u32 = 8;

/// Sections of dirty metadata the filesystem layer expects to flush at the
/// next checkpoint. Published by the collaborator; used for headroom checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirtyMetaSections {
    pub node: u32,
    pub dentry: u32,
    pub imeta: u32,
}

impl DirtyMetaSections {
    /// Sections a checkpoint may consume: dentries count double.
    #[must_use]
    pub fn headroom(&self) -> u32 {
        self.node
            .saturating_add(self.dentry.saturating_mul(2))
            .saturating_add(self.imeta)
    }
}

/// Background GC behaviour for one band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandPolicy {
    pub wait_ms: u64,
    /// Use greedy selection and collect in the foreground manner.
    pub greedy: bool,
    /// Only run when the device is idle.
    pub idle_required: bool,
    /// Sections per pass forced to foreground; 0 = none.
    pub iolimit: u32,
}

impl BandPolicy {
    const fn new(wait_ms: u64, greedy: bool, idle_required: bool, iolimit: u32) -> Self {
        Self {
            wait_ms,
            greedy,
            idle_required,
            iolimit,
        }
    }
}

/// Free-section thresholds, all in sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcLevels {
    pub l1: u32,
    pub l2: u32,
    pub l3: u32,
    pub l4: u32,
    pub l5: u32,
    pub l6: u32,
    pub ovp_sections: u32,
    pub reserved_sections: u32,
}

impl GcLevels {
    /// Compute thresholds for `geo` with `bad_sections` retired.
    pub fn compute(geo: &Geometry, bad_sections: u32) -> Result<Self> {
        let sps = geo.segs_per_sec;
        let ovp_sections = geo.overprov_sections();
        if bad_sections >= ovp_sections && bad_sections > 0 {
            return Err(LfsError::Config(format!(
                "{bad_sections} bad sections leave no overprovisioned space ({ovp_sections})"
            )));
        }
        let reserved_segments = geo
            .reserved_segments
            .saturating_add(bad_sections.saturating_mul(sps));
        let reserved_sections = reserved_segments / sps;

        let l6 = reserved_sections;
        let l5 = l6 + 4;
        let mut l4 = l5 + 3 + 768_u32.div_ceil(sps).max(2);
        let mut l3 = l4 + 768_u32.div_ceil(sps).min(4);
        if ovp_sections > l3 && (ovp_sections - l3).saturating_mul(sps) > 2048 {
            let extra = (ovp_sections - l3) / 4;
            l3 += extra;
            l4 += extra;
        }
        let main = geo.main_sections();
        Ok(Self {
            l1: main / 4,
            l2: main / 8,
            l3: l3.min(ovp_sections),
            l4: l4.min(ovp_sections),
            l5: l5.min(ovp_sections),
            l6,
            ovp_sections,
            reserved_sections,
        })
    }

    /// Band index 0..=5 for `free_secs` (0 = most free space).
    #[must_use]
    pub fn band(&self, free_secs: u32) -> u8 {
        if free_secs > self.l1 {
            0
        } else if free_secs > self.l2 {
            1
        } else if free_secs > self.l3 {
            2
        } else if free_secs > self.l4 {
            3
        } else if free_secs > self.l5 {
            4
        } else {
            5
        }
    }

    #[must_use]
    pub fn band_policy(&self, free_secs: u32, fragmented: bool) -> BandPolicy {
        match (self.band(free_secs), fragmented) {
            (0, _) => BandPolicy::new(120 * MIN_WT_MS, false, true, 0),
            (1, true) => BandPolicy::new(5 * MIN_WT_MS, false, true, 0),
            (1, false) => BandPolicy::new(60 * MIN_WT_MS, false, true, 0),
            (2, true) => BandPolicy::new(MIN_WT_MS, true, true, WEAK_IOLIMIT),
            (2, false) => BandPolicy::new(30 * MIN_WT_MS, false, true, 0),
            (3, true) => BandPolicy::new(0, true, true, STRONG_IOLIMIT),
            (3, false) => BandPolicy::new(5 * MIN_WT_MS, true, true, STRONG_IOLIMIT),
            (4, _) => BandPolicy::new(0, true, true, 0),
            _ => BandPolicy::new(0, true, false, 0),
        }
    }

    /// 0..=6; 6 when `not_enough_free` (foreground GC territory).
    #[must_use]
    pub fn pressure_level(&self, free_secs: u32, not_enough_free: bool) -> u8 {
        if not_enough_free {
            6
        } else {
            self.band(free_secs)
        }
    }

    /// Whether `free_secs + freed` leaves less headroom than the next
    /// checkpoint and `needed` more sections could consume.
    #[must_use]
    pub fn has_not_enough_free_secs(
        &self,
        free_secs: u32,
        freed: u32,
        needed: u32,
        meta: DirtyMetaSections,
    ) -> bool {
        u64::from(free_secs) + u64::from(freed)
            <= u64::from(meta.headroom())
                + u64::from(self.reserved_sections)
                + u64::from(needed)
    }
}

/// More than half of the free space sits in holes inside dirty segments.
#[must_use]
pub fn is_fragmented(free_blocks: u64, free_secs: u32, blocks_per_sec: u64) -> bool {
    let whole = u64::from(free_secs) * blocks_per_sec;
    free_blocks.saturating_sub(whole) > whole
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo(segs_per_sec: u32, main_segments: u32, reserved: u32, ovp: u32) -> Geometry {
        Geometry {
            blocks_per_seg: 512,
            segs_per_sec,
            secs_per_zone: 1,
            main_blkaddr: 0x1000,
            main_segments,
            reserved_segments: reserved,
            overprov_segments: ovp,
            slc_segs_per_sec: 0,
        }
    }

    // ── Thresholds ──────────────────────────────────────────────────────

    #[test]
    fn levels_follow_formulas_and_clamp_to_ovp() {
        // Large sections keep the 768-segment terms small.
        let levels = GcLevels::compute(&geo(512, 512 * 64, 512 * 2, 512 * 16), 0).expect("levels");
        assert_eq!(levels.l6, 2);
        assert_eq!(levels.l5, 6);
        // l4 = 6 + 3 + max(ceil(768/512)=2, 2) = 11, l3 = 11 + min(2, 4) = 13
        assert_eq!(levels.l4, 11);
        assert_eq!(levels.l3, 13);
        assert_eq!(levels.l2, 8);
        assert_eq!(levels.l1, 16);

        let tight = GcLevels::compute(&geo(1, 4096, 12, 24), 0).expect("levels");
        assert_eq!(tight.l6, 12);
        assert_eq!(tight.l5, 16);
        assert_eq!(tight.l4, 24, "clamped to ovp");
        assert_eq!(tight.l3, 24);
    }

    #[test]
    fn large_overprovision_adds_extra_to_l3_and_l4() {
        // ovp - l3 = 300 - 61 = 239 sections * 16 segs > 2048
        let levels = GcLevels::compute(&geo(16, 16 * 1024, 16 * 2, 16 * 300), 0).expect("levels");
        // l4 = 6 + 3 + 48 = 57 (no clamp), l3 = 57 + 4 = 61; extra = (300 - 61) / 4 = 59
        assert_eq!(levels.l4, 57 + 59);
        assert_eq!(levels.l3, 61 + 59);
    }

    #[test]
    fn bad_sections_raise_reserved_floor() {
        let g = geo(1, 1024, 12, 64);
        let base = GcLevels::compute(&g, 0).expect("levels");
        let worn = GcLevels::compute(&g, 10).expect("levels");
        assert_eq!(worn.l6, base.l6 + 10);
        assert!(matches!(GcLevels::compute(&g, 64), Err(LfsError::Config(_))));
    }

    // ── Bands ───────────────────────────────────────────────────────────

    #[test]
    fn band_table() {
        let levels = GcLevels {
            l1: 100,
            l2: 50,
            l3: 30,
            l4: 20,
            l5: 10,
            l6: 5,
            ovp_sections: 40,
            reserved_sections: 5,
        };
        assert_eq!(levels.band_policy(101, false).wait_ms, 120 * MIN_WT_MS);
        assert_eq!(levels.band_policy(60, true).wait_ms, 5 * MIN_WT_MS);
        assert_eq!(levels.band_policy(60, false).wait_ms, 60 * MIN_WT_MS);
        let mid_frag = levels.band_policy(40, true);
        assert!(mid_frag.greedy);
        assert_eq!(mid_frag.iolimit, 4);
        assert!(!levels.band_policy(40, false).greedy);
        assert_eq!(levels.band_policy(25, true).wait_ms, 0);
        assert_eq!(levels.band_policy(25, false).iolimit, 8);
        let last = levels.band_policy(3, false);
        assert!(!last.idle_required);
        assert!(last.greedy);

        assert_eq!(levels.pressure_level(101, false), 0);
        assert_eq!(levels.pressure_level(15, false), 4);
        assert_eq!(levels.pressure_level(5, false), 5);
        assert_eq!(levels.pressure_level(200, true), 6);
    }

    #[test]
    fn headroom_counts_dentries_twice() {
        let levels = GcLevels::compute(&geo(1, 1024, 12, 64), 0).expect("levels");
        let meta = DirtyMetaSections {
            node: 1,
            dentry: 2,
            imeta: 1,
        };
        // 6 + 12 = 18
        assert!(levels.has_not_enough_free_secs(18, 0, 0, meta));
        assert!(!levels.has_not_enough_free_secs(19, 0, 0, meta));
        assert!(!levels.has_not_enough_free_secs(15, 4, 0, meta));
        assert!(levels.has_not_enough_free_secs(19, 0, 1, meta));
    }

    #[test]
    fn fragmentation_heuristic() {
        assert!(!is_fragmented(1000, 2, 512));
        assert!(is_fragmented(2100, 2, 512));
        assert!(!is_fragmented(0, 0, 512));
    }
}
