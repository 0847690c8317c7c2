//! SHGC Mutator Fast-Path Benchmarks
//!
//! Run with: `cargo bench --package shgc`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shgc::heap::SLOT_SIZE;
use shgc::{
    BarrierPolicy, Generation, LocalMarkStatus, MutatorThread, Runtime, ShgcConfig, SpaceKind,
    TaggedValue,
};
use std::sync::Arc;

fn create_runtime() -> (Runtime, Arc<MutatorThread>) {
    let runtime = Runtime::new(ShgcConfig::default()).unwrap();
    let thread = runtime.create_thread().unwrap();
    thread.start().unwrap();
    (runtime, thread)
}

fn bench_single_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_store");
    let (runtime, thread) = create_runtime();
    let old = runtime.allocate(&thread, Generation::Old, 64).unwrap();
    let young = runtime.allocate(&thread, Generation::Young, 64).unwrap();
    let shared = runtime.allocate(&thread, Generation::SharedOld, 64).unwrap();

    group.bench_function("no_barrier_int", |b| {
        b.iter(|| {
            runtime
                .store(&thread, old, 0, black_box(TaggedValue::from_int(7)), BarrierPolicy::NoBarrier)
                .unwrap()
        })
    });

    group.bench_function("unknown_barrier_int", |b| {
        b.iter(|| {
            runtime
                .store(
                    &thread,
                    old,
                    0,
                    black_box(TaggedValue::from_int(7)),
                    BarrierPolicy::UnknownBarrier,
                )
                .unwrap()
        })
    });

    group.bench_function("old_to_young", |b| {
        b.iter(|| {
            runtime
                .store(
                    &thread,
                    old,
                    8,
                    black_box(TaggedValue::from_object(young)),
                    BarrierPolicy::NeedBarrier,
                )
                .unwrap()
        })
    });

    group.bench_function("local_to_shared", |b| {
        b.iter(|| {
            runtime
                .store(
                    &thread,
                    old,
                    16,
                    black_box(TaggedValue::from_object(shared)),
                    BarrierPolicy::NeedBarrier,
                )
                .unwrap()
        })
    });

    runtime.set_local_mark_status(&thread, LocalMarkStatus::Marking);
    group.bench_function("old_to_young_marking", |b| {
        b.iter(|| {
            runtime
                .store(
                    &thread,
                    old,
                    8,
                    black_box(TaggedValue::from_object(young)),
                    BarrierPolicy::NeedBarrier,
                )
                .unwrap()
        })
    });

    group.finish();
}

fn bench_batch_barrier(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_barrier");
    let (runtime, thread) = create_runtime();
    let old = runtime
        .heap()
        .provision_region(SpaceKind::Old, thread.id())
        .unwrap()
        .start();
    let young = runtime.allocate(&thread, Generation::Young, 64).unwrap();

    for count in [16usize, 256, 4096] {
        for i in 0..count {
            let value = if i % 3 == 0 {
                TaggedValue::from_object(young)
            } else {
                TaggedValue::from_int(i as i32)
            };
            runtime.heap().write_slot(old + i * SLOT_SIZE, value).unwrap();
        }

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("batched", count), &count, |b, &count| {
            b.iter(|| runtime.store_batch(&thread, old, black_box(count)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("per_slot", count), &count, |b, &count| {
            b.iter(|| {
                for i in 0..count {
                    let slot = old + i * SLOT_SIZE;
                    let value = runtime.heap().read_slot(slot).unwrap();
                    runtime
                        .store(&thread, slot, 0, value, BarrierPolicy::UnknownBarrier)
                        .unwrap();
                }
            })
        });
    }

    group.finish();
}

fn bench_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");
    let (runtime, thread) = create_runtime();

    for size in [16usize, 64, 256] {
        group.bench_with_input(BenchmarkId::new("young", size), &size, |b, &size| {
            b.iter(|| {
                if runtime.allocate(&thread, Generation::Young, black_box(size)).is_err() {
                    runtime.heap().release_owned_by(thread.id());
                }
            })
        });
    }

    group.finish();
}

fn bench_safepoint_poll(c: &mut Criterion) {
    let (runtime, thread) = create_runtime();
    c.bench_function("safepoint_poll", |b| {
        b.iter(|| runtime.poll_safepoint(black_box(&thread)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_single_store,
    bench_batch_barrier,
    bench_allocation,
    bench_safepoint_poll
);
criterion_main!(benches);
