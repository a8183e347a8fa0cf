//! Randomized workloads must always finish with every object intact.

use lfs::GcMode;
use lfs_harness::{WorkloadConfig, run_workload};
use proptest::prelude::*;

fn gc_mode() -> impl Strategy<Value = GcMode> {
    prop_oneof![Just(GcMode::Normal), Just(GcMode::IdleCb), Just(GcMode::IdleGreedy), Just(GcMode::Urgent)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn any_seed_keeps_objects_and_accounting_consistent(
        seed in any::<u64>(),
        utilization in 20_u8..70,
        checkpoint_every in 1_u64..200,
        gc_every in 0_u64..300,
        mode in gc_mode(),
    ) {
        let config = WorkloadConfig {
            seed,
            operations: 1_500,
            max_utilization_pct: utilization,
            checkpoint_every,
            gc_every,
            trim_every: 700,
            remount_every: 1_000,
            gc_mode: mode,
            ..WorkloadConfig::default()
        };
        let report = run_workload(&config).expect("run");
        prop_assert!(report.passed, "seed {seed:#x}: {:?}", report.failure);
        prop_assert!(!report.stats.need_fsck);
        prop_assert_eq!(report.stats.usage.valid_blocks, report.live_objects);
    }
}
