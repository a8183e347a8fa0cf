//! Scoring functions. Lower cost wins; all are pure.

/// Inputs to the cost-benefit score.
#[derive(Debug, Clone, Copy)]
pub struct CbInput {
    /// Valid blocks averaged over the section's segments.
    pub valid_per_seg: u32,
    pub blocks_per_seg: u32,
    pub mtime: u64,
    pub min_mtime: u64,
    pub max_mtime: u64,
    pub max_age: u32,
}

/// Utilization in percent of one segment.
#[must_use]
pub fn utilization(valid: u32, blocks_per_seg: u32) -> u32 {
    if blocks_per_seg == 0 {
        return 0;
    }
    let pct = u64::from(valid) * 100 / u64::from(blocks_per_seg);
    u32::try_from(pct.min(100)).unwrap_or(100)
}

/// `age` component of cost-benefit: `max_age` for the oldest section,
/// 0 for the youngest.
#[must_use]
pub fn cb_age(mtime: u64, min_mtime: u64, max_mtime: u64, max_age: u32) -> u64 {
    if max_mtime <= min_mtime {
        return 0;
    }
    let span = u128::from(max_mtime - min_mtime);
    let offset = u128::from(mtime.clamp(min_mtime, max_mtime) - min_mtime);
    let scaled = u128::from(max_age) * offset / span;
    u64::from(max_age) - u64::try_from(scaled).unwrap_or(u64::from(max_age))
}

/// `UINT_MAX − 100·(100−u)·age / (100+u)`.
#[must_use]
pub fn cb_cost(input: CbInput) -> u64 {
    let u = u64::from(utilization(input.valid_per_seg, input.blocks_per_seg));
    let age = cb_age(input.mtime, input.min_mtime, input.max_mtime, input.max_age);
    let benefit = 100 * (100 - u) * age / (100 + u);
    u64::from(u32::MAX).saturating_sub(benefit)
}

/// Maximum age for cost-benefit: shrinks when free space is scarce.
#[must_use]
pub fn cb_max_age(perf_ratio: u32, low_free_ratio: u32, default_max_age: u32) -> u32 {
    if perf_ratio < low_free_ratio {
        (10 * perf_ratio).max(1)
    } else {
        default_max_age
    }
}

/// Age-threshold score parameters for one lookup.
#[derive(Debug, Clone, Copy)]
pub struct AtScale {
    /// `max_mtime + 1`, exclusive upper bound.
    pub end_mtime: u64,
    pub total: u64,
    pub accu: u64,
    pub age_weight: u64,
}

impl AtScale {
    #[must_use]
    pub fn new(min_mtime: u64, max_mtime: u64, accuracy_class: u64, age_weight: u32) -> Self {
        let end_mtime = max_mtime.saturating_add(1);
        let total = end_mtime.saturating_sub(min_mtime).max(1);
        Self {
            end_mtime,
            total,
            accu: (u64::MAX / total / 100).min(accuracy_class),
            age_weight: u64::from(age_weight.min(100)),
        }
    }

    /// `(cost, age)` for a section with `vblocks` of `sec_blocks` valid.
    #[must_use]
    pub fn score(&self, mtime: u64, vblocks: u64, sec_blocks: u64) -> (u64, u64) {
        let age = mul_div(self.accu, self.end_mtime.saturating_sub(mtime), self.total)
            * self.age_weight;
        let u = mul_div(self.accu, sec_blocks.saturating_sub(vblocks), sec_blocks.max(1))
            * (100 - self.age_weight);
        (u64::from(u32::MAX).saturating_sub(age + u), age)
    }
}

fn mul_div(a: u64, b: u64, c: u64) -> u64 {
    u64::try_from(u128::from(a) * u128::from(b) / u128::from(c)).unwrap_or(u64::MAX)
}

/// Adjacent-SSR: prefer segments with more checkpoint-valid blocks, ties to
/// the one whose mtime is closest to `query`.
#[must_use]
pub fn assr_score(ckpt_valid: u32, mtime: u64, query: u64, end_mtime: u64) -> (u64, u64) {
    let closeness = end_mtime.saturating_sub(query.abs_diff(mtime));
    (u64::from(u32::MAX) - u64::from(ckpt_valid), closeness)
}
