//! Benchmark: block allocation, invalidation and collection on a small
//! in-memory volume.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use lfs::{AllocDiscipline, ObjectRef, SegKind, VolumeConfig};
use lfs_harness::{MemVolume, WorkloadConfig, run_workload, small_geometry};

fn bench_allocate_invalidate(c: &mut Criterion) {
    let rig = MemVolume::format(small_geometry(), VolumeConfig::default(), 64).expect("rig");
    let mut group = c.benchmark_group("allocate_invalidate");

    for (name, discipline) in [
        ("append", AllocDiscipline::Append),
        ("auto", AllocDiscipline::Auto),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let addr = rig
                    .volume
                    .allocate_block(black_box(SegKind::HotData), discipline)
                    .expect("alloc");
                rig.volume.invalidate_block(addr).expect("invalidate");
            });
        });
    }
    group.finish();
}

fn bench_gc_pass(c: &mut Criterion) {
    c.bench_function("gc_pass_half_live_segment", |b| {
        b.iter_with_setup(
            || {
                let rig = MemVolume::format(small_geometry(), VolumeConfig::default(), 64)
                    .expect("rig");
                for id in 0..64 {
                    let owner = ObjectRef { owner: id, offset: 0 };
                    rig.write_object(owner, SegKind::WarmData, AllocDiscipline::Append, 0)
                        .expect("write");
                }
                for id in (0..32).step_by(2) {
                    rig.delete_object(ObjectRef { owner: id, offset: 0 })
                        .expect("delete");
                }
                rig
            },
            |rig| black_box(rig.volume.trigger_gc(false).expect("gc")),
        );
    });
}

fn bench_workload(c: &mut Criterion) {
    let config = WorkloadConfig {
        operations: 2_000,
        ..WorkloadConfig::default()
    };
    let mut group = c.benchmark_group("workload");
    group.sample_size(10);
    group.bench_function("mixed_2000_ops", |b| {
        b.iter(|| black_box(run_workload(&config).expect("run")));
    });
    group.finish();
}

criterion_group!(benches, bench_allocate_invalidate, bench_gc_pass, bench_workload);
criterion_main!(benches);
