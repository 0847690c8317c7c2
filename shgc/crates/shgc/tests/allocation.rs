//! Allocation fast path and runtime allocator

mod common;

use common::{RuntimeFixture, REGION_SIZE, SLOT};
use shgc::{CollectorHooks, Generation, Heap, ShgcConfig, ShgcError, SpaceKind};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn young_allocations_are_contiguous_and_aligned() {
    let fx = RuntimeFixture::new();
    let mut previous = fx.object(Generation::Young, 1);
    for size in [1, 7, 8, 13, 64] {
        let addr = fx.runtime.allocate(&fx.thread, Generation::Young, size).unwrap();
        assert_eq!(addr % SLOT, 0);
        assert!(addr > previous);
        previous = addr;
    }
    assert_eq!(fx.runtime.stats().slow_allocations, 1);
}

#[test]
fn exact_remaining_size_fits_inline() {
    let fx = RuntimeFixture::new();
    let first = fx.object(Generation::Young, 1);
    let region = fx.runtime.heap().region_of(first).unwrap();

    // Fill up to exactly one object of `remaining` bytes left.
    let remaining = region.remaining();
    let huge_threshold = fx.runtime.heap().config().huge_threshold;
    let mut left = remaining;
    while left > huge_threshold {
        fx.runtime.allocate(&fx.thread, Generation::Young, huge_threshold).unwrap();
        left -= huge_threshold;
    }

    let slow_before = fx.runtime.stats().slow_allocations;
    let last = fx.runtime.allocate(&fx.thread, Generation::Young, left).unwrap();
    assert_eq!(last + left, region.limit());
    assert_eq!(region.remaining(), 0);
    assert_eq!(fx.runtime.stats().slow_allocations, slow_before);

    // One more slot takes the runtime call and a new region.
    let next = fx.object(Generation::Young, 1);
    assert_ne!(fx.runtime.heap().region_of(next).unwrap().index(), region.index());
    assert_eq!(fx.runtime.stats().slow_allocations, slow_before + 1);
}

#[test]
fn generations_land_in_matching_spaces() {
    let fx = RuntimeFixture::new();
    let cases = [
        (Generation::Young, SpaceKind::Young),
        (Generation::Old, SpaceKind::Old),
        (Generation::SharedOld, SpaceKind::SharedOld),
        (Generation::SharedNonMovable, SpaceKind::SharedNonMovable),
    ];
    for (generation, kind) in cases {
        let addr = fx.object(generation, 4);
        let region = fx.runtime.heap().region_of(addr).unwrap();
        assert_eq!(region.kind(), Some(kind), "{:?}", generation);
    }
}

#[test]
fn huge_objects_span_regions() {
    let fx = RuntimeFixture::new();
    let size = 3 * REGION_SIZE + 8;
    let addr = fx.runtime.allocate(&fx.thread, Generation::Old, size).unwrap();

    let head = fx.runtime.heap().region_of(addr).unwrap();
    assert_eq!(head.kind(), Some(SpaceKind::Huge));
    assert_eq!(head.span(), 4);
    // Interior addresses resolve to the head descriptor.
    let tail = fx.runtime.heap().region_of(addr + size - SLOT).unwrap();
    assert_eq!(tail.index(), head.index());
}

#[test]
fn allocation_is_a_safepoint() {
    let fx = RuntimeFixture::new();
    let polls = fx.thread.safepoint_polls();
    fx.object(Generation::Old, 2);
    assert!(fx.thread.safepoint_polls() > polls);
}

#[test]
fn terminated_thread_cannot_take_the_runtime_call() {
    let fx = RuntimeFixture::new();
    fx.runtime.terminate(&fx.thread);
    let err = fx.runtime.allocate(&fx.thread, Generation::Old, 8).unwrap_err();
    assert!(matches!(err, ShgcError::ThreadTerminated { .. }));
}

#[test]
fn out_of_memory_after_single_hook_retry() {
    struct CountingHooks(AtomicUsize);
    impl CollectorHooks for CountingHooks {
        fn on_allocation_failure(&self, _: &Heap, _: Generation, _: usize) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    let fx = RuntimeFixture::with_config(ShgcConfig::sized(REGION_SIZE, 4));
    let hooks = Arc::new(CountingHooks(AtomicUsize::new(0)));
    fx.runtime.set_collector_hooks(hooks.clone());

    let mut regions = HashSet::new();
    let err = loop {
        match fx.runtime.allocate(&fx.thread, Generation::Young, REGION_SIZE / 2) {
            Ok(addr) => {
                regions.insert(fx.runtime.heap().region_of(addr).unwrap().index());
            },
            Err(e) => break e,
        }
    };

    assert!(err.is_out_of_memory());
    assert_eq!(regions.len(), 4);
    assert_eq!(hooks.0.load(Ordering::SeqCst), 1);
    assert_eq!(fx.runtime.stats().allocation_failures, 1);
}

#[test]
fn concurrent_shared_allocations_do_not_overlap() {
    let fx = RuntimeFixture::with_config(ShgcConfig::sized(REGION_SIZE, 64));
    let runtime = Arc::clone(&fx.runtime);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let runtime = Arc::clone(&runtime);
            std::thread::spawn(move || {
                let thread = runtime.create_thread().unwrap();
                thread.start().unwrap();
                (0..500)
                    .map(|_| {
                        runtime
                            .allocate(&thread, Generation::SharedOld, 48)
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for addr in handle.join().unwrap() {
            assert!(seen.insert(addr), "address {:#x} handed out twice", addr);
        }
    }
    assert_eq!(seen.len(), 2000);
}
