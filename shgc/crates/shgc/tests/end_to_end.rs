//! Whole-substrate scenarios

mod common;

use common::{RuntimeFixture, REGION_SIZE, SLOT};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shgc::{
    BarrierPolicy, Generation, LocalMarkStatus, RememberedSetKind, SharedMarkStatus, SpaceKind,
    TaggedValue, ThreadState,
};
use std::collections::BTreeSet;

#[test]
fn old_region_gets_lazy_old_to_new_set() {
    let fx = RuntimeFixture::new();
    let old = fx.region(SpaceKind::Old);
    let young = fx.object(Generation::Young, 4);
    let region = fx.runtime.heap().region_of(old).unwrap();
    let quad_slots = fx.runtime.heap().config().quad_slots;

    assert!(region.remembered_set(RememberedSetKind::OldToNew).is_none());

    fx.runtime
        .store(&fx.thread, old, 3 * SLOT, TaggedValue::from_object(young), BarrierPolicy::NeedBarrier)
        .unwrap();
    let set = region.remembered_set(RememberedSetKind::OldToNew).unwrap();
    let first_quad = 3 / quad_slots;
    assert!(set.is_quad_set(first_quad));
    assert_eq!(set.set_bit_count(), 1);

    fx.runtime
        .store(
            &fx.thread,
            old,
            (3 + quad_slots) * SLOT,
            TaggedValue::from_object(young),
            BarrierPolicy::NeedBarrier,
        )
        .unwrap();
    // Same set, first bit kept.
    let again = region.remembered_set(RememberedSetKind::OldToNew).unwrap();
    assert!(std::sync::Arc::ptr_eq(&set, &again));
    assert!(set.is_quad_set(first_quad));
    assert!(set.is_quad_set(first_quad + 1));
    assert_eq!(set.set_bit_count(), 2);
}

#[test]
fn marking_visibility_is_independent_of_batching() {
    let mut rng = StdRng::seed_from_u64(0xfeed);
    let count = 256;
    let choices: Vec<u8> = (0..count).map(|_| rng.gen_range(0..4)).collect();

    let grey_sets = |batched: bool| {
        let fx = RuntimeFixture::new();
        let container = fx.region(SpaceKind::Old);
        let young = fx.region(SpaceKind::Young);
        let shared = fx.region(SpaceKind::SharedOld);
        fx.runtime
            .set_local_mark_status(&fx.thread, LocalMarkStatus::Marking);
        fx.runtime
            .broadcast_shared_mark_status(SharedMarkStatus::ConcurrentMarkingOrFinished);

        for (i, choice) in choices.iter().enumerate() {
            let value = match choice {
                0 => TaggedValue::from_int(i as i32),
                1 => TaggedValue::from_object(young + (i % 16) * SLOT),
                2 => TaggedValue::from_object(shared + (i % 16) * SLOT),
                _ => TaggedValue::NULL,
            };
            let slot = container + i * SLOT;
            if batched {
                fx.runtime.heap().write_slot(slot, value).unwrap();
            } else {
                fx.runtime
                    .store(&fx.thread, container, i * SLOT, value, BarrierPolicy::UnknownBarrier)
                    .unwrap();
            }
        }
        if batched {
            fx.runtime.store_batch(&fx.thread, container, count).unwrap();
        }

        let local: BTreeSet<usize> = fx
            .thread
            .gray()
            .drain()
            .into_iter()
            .map(|a| a - young)
            .collect();
        let shared_gray: BTreeSet<usize> = fx
            .runtime
            .heap()
            .shared_gray()
            .drain()
            .into_iter()
            .map(|a| a - shared)
            .collect();
        (local, shared_gray)
    };

    let single = grey_sets(false);
    let batched = grey_sets(true);
    assert_eq!(single, batched);
    assert!(!single.0.is_empty());
    assert!(!single.1.is_empty());
}

#[test]
fn allocations_never_overrun_their_region() {
    let fx = RuntimeFixture::new();
    let mut rng = StdRng::seed_from_u64(3);
    let threshold = fx.runtime.heap().config().huge_threshold;

    for _ in 0..2000 {
        let size = rng.gen_range(1..=threshold / 64);
        let addr = fx.runtime.allocate(&fx.thread, Generation::Young, size).unwrap();
        let region = fx.runtime.heap().region_of(addr).unwrap();
        assert!(addr >= region.start());
        assert!(addr + size <= region.limit());
        assert!(region.top() <= region.limit());
    }
    assert!(fx.runtime.stats().fast_allocations > fx.runtime.stats().slow_allocations);
}

#[test]
fn collector_cycle_with_stop_the_world() {
    let fx = RuntimeFixture::new();
    let other = fx.runtime.create_thread().unwrap();
    other.start().unwrap();
    other.enter_native().unwrap();

    let old = fx.object(Generation::Old, 8);
    let young = fx.object(Generation::Young, 2);
    let shared = fx.object(Generation::SharedOld, 2);
    fx.runtime
        .store(&fx.thread, old, 0, TaggedValue::from_object(young), BarrierPolicy::NeedBarrier)
        .unwrap();
    fx.runtime
        .store(&fx.thread, old, SLOT, TaggedValue::from_object(shared), BarrierPolicy::NeedBarrier)
        .unwrap();

    {
        let world = fx.runtime.stop_the_world(Some(&fx.thread)).unwrap();
        assert_eq!(world.threads(), 1);
        assert_eq!(other.state(), ThreadState::Suspended);

        // The collector consumes the remembered sets while the world is stopped.
        let region = fx.runtime.heap().region_of(old).unwrap();
        let mut dirty = Vec::new();
        region
            .remembered_set(RememberedSetKind::OldToNew)
            .unwrap()
            .for_each_slot(|slot| dirty.push(slot));
        assert!(dirty.contains(&old));
        region.clear_remembered_set(RememberedSetKind::OldToNew);
    }

    assert_eq!(other.state(), ThreadState::Native);
    other.leave_native().unwrap();

    let region = fx.runtime.heap().region_of(old).unwrap();
    assert!(region
        .remembered_set(RememberedSetKind::LocalToShared)
        .unwrap()
        .contains_slot(old + SLOT));
}

#[test]
fn destroyed_thread_gives_back_local_regions_only() {
    let fx = RuntimeFixture::new();
    let worker = fx.runtime.create_thread().unwrap();
    worker.start().unwrap();

    fx.runtime.allocate(&worker, Generation::Young, 64).unwrap();
    fx.runtime.allocate(&worker, Generation::Old, 64).unwrap();
    fx.runtime
        .allocate(&worker, Generation::Old, 2 * REGION_SIZE)
        .unwrap();
    let shared = fx.runtime.allocate(&worker, Generation::SharedOld, 64).unwrap();

    let in_use = fx.runtime.heap().regions_in_use();
    assert_eq!(fx.runtime.destroy_thread(&worker).unwrap(), 3);
    // Young + Old + a two-descriptor huge span are gone; the shared region stays.
    assert_eq!(fx.runtime.heap().regions_in_use(), in_use - 4);
    assert!(fx.runtime.heap().region_of(shared).is_some());
}
