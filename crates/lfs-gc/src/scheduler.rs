//! Decision table for the GC worker.
//!
//! Given why the worker woke and a snapshot of free-space pressure, the
//! scheduler says whether to run a pass (and of which type), skip, or exit,
//! and how long to sleep afterwards. It holds no locks and no clock.

use crate::GcConfig;
use lfs_segment::{BandPolicy, MIN_WT_MS};
use lfs_types::{GcMode, GcType};
use serde::{Deserialize, Serialize};

/// Why the worker woke. Greater reasons win when wakes coalesce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WakeReason {
    TimerElapsed,
    PressureChanged,
    ShutdownRequested,
}

/// Free-space pressure as seen at wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PressureSnapshot {
    pub free_sections: u32,
    pub prefree_sections: u32,
    /// 0..=6, see `GcLevels::pressure_level`.
    pub level: u8,
    pub not_enough_free: bool,
    pub fragmented: bool,
    pub policy: BandPolicy,
    pub gc_mode: GcMode,
    pub device_idle: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The band only collects on an idle device.
    DeviceBusy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Run(GcType),
    Skip(SkipReason),
    Exit,
}

#[derive(Debug, Clone)]
pub struct GcScheduler {
    urgent_wait_ms: u64,
    busy_wait_ms: u64,
    backoff_after: u32,
    /// Consecutive passes that found no victim.
    victimless: u32,
}

impl GcScheduler {
    #[must_use]
    pub fn new(config: &GcConfig) -> Self {
        Self {
            urgent_wait_ms: config.urgent_wait_ms,
            busy_wait_ms: config.busy_wait_ms,
            backoff_after: config.no_victim_backoff,
            victimless: 0,
        }
    }

    #[must_use]
    pub fn decide(&self, wake: Option<WakeReason>, snap: &PressureSnapshot) -> Decision {
        match wake {
            Some(WakeReason::ShutdownRequested) => return Decision::Exit,
            Some(WakeReason::PressureChanged) if snap.not_enough_free => {
                return Decision::Run(GcType::Foreground);
            }
            _ => {}
        }
        if snap.gc_mode == GcMode::Urgent {
            return Decision::Run(GcType::Background);
        }
        if snap.policy.idle_required && !snap.device_idle {
            return Decision::Skip(SkipReason::DeviceBusy);
        }
        Decision::Run(GcType::Background)
    }

    /// Note the result of a pass.
    pub fn record_pass(&mut self, found_victim: bool) {
        if found_victim {
            self.victimless = 0;
        } else {
            self.victimless = self.victimless.saturating_add(1);
        }
    }

    #[must_use]
    pub fn victimless_passes(&self) -> u32 {
        self.victimless
    }

    /// Sleep before the next wake-up.
    pub fn next_wait_ms(&mut self, snap: &PressureSnapshot) -> u64 {
        if self.victimless > self.backoff_after {
            self.victimless = 0;
            return MIN_WT_MS;
        }
        if snap.gc_mode == GcMode::Urgent {
            return self.urgent_wait_ms;
        }
        let wait = snap.policy.wait_ms;
        if wait == 0 && !snap.device_idle {
            return self.busy_wait_ms;
        }
        wait
    }
}
