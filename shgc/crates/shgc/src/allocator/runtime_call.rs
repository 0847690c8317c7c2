//! Runtime Call - Slow-Path Allocator
//!
//! Reached when the inline path cannot serve a request:
//! - young region full (or none yet): retire it and provision a new one
//! - Old: the thread's old region, bump allocated with a CAS
//! - SharedOld / SharedNonMovable: the heap's shared cursor
//! - larger than the huge threshold: a dedicated Huge region span
//!
//! The call is a safepoint: it polls before doing any work, so a thread
//! allocating in a loop can always be suspended.

use crate::allocator::CollectorHooks;
use crate::error::{Result, ShgcError};
use crate::heap::{Generation, Heap, SpaceKind, NO_REGION};
use crate::logging::{log_event, SubstrateEvent};
use crate::stats::Counter;
use crate::thread::MutatorThread;

/// Runtime allocator entry point
///
/// `size` must already be slot aligned.
pub fn runtime_allocate(
    heap: &Heap,
    thread: &MutatorThread,
    generation: Generation,
    size: usize,
    hooks: &dyn CollectorHooks,
) -> Result<usize> {
    thread.poll_safepoint()?;
    heap.stats().bump(Counter::SlowAllocation);

    if let Some(addr) = try_allocate(heap, thread, generation, size)? {
        return Ok(addr);
    }

    log::warn!(
        "thread {}: {:?} allocation of {} bytes failed, asking collector",
        thread.id(),
        generation,
        size
    );
    log_event(SubstrateEvent::AllocationFailure {
        size,
        generation: format!("{:?}", generation),
        after_hook: false,
    });

    if hooks.on_allocation_failure(heap, generation, size) {
        if let Some(addr) = try_allocate(heap, thread, generation, size)? {
            return Ok(addr);
        }
    }

    heap.stats().bump(Counter::AllocationFailure);
    log::error!(
        "thread {}: out of memory allocating {} bytes in {:?}",
        thread.id(),
        size,
        generation
    );
    log_event(SubstrateEvent::AllocationFailure {
        size,
        generation: format!("{:?}", generation),
        after_hook: true,
    });
    Err(ShgcError::OutOfMemory {
        requested: size,
        available: heap.free_region_count() * heap.region_size(),
    })
}

/// One allocation attempt; `Ok(None)` when the heap has no room
fn try_allocate(
    heap: &Heap,
    thread: &MutatorThread,
    generation: Generation,
    size: usize,
) -> Result<Option<usize>> {
    if size > heap.config().huge_threshold && !generation.is_shared() {
        return allocate_huge(heap, thread, size);
    }
    match generation {
        Generation::Young => refill_young(heap, thread, size),
        Generation::Old => allocate_old(heap, thread, size),
        Generation::SharedOld | Generation::SharedNonMovable => {
            heap.allocate_shared(generation.space_kind(), size)
        },
    }
}

/// Region `index` if it is still a `kind` region owned by `thread`
fn owned_region<'h>(
    heap: &'h Heap,
    thread: &MutatorThread,
    index: usize,
    kind: SpaceKind,
) -> Option<&'h crate::heap::Region> {
    if index == NO_REGION {
        return None;
    }
    heap.region_at(index)
        .filter(|r| r.kind() == Some(kind) && r.owner() == thread.id())
}

fn provision_or_none(heap: &Heap, kind: SpaceKind, owner: u32) -> Result<Option<&crate::heap::Region>> {
    match heap.provision_region(kind, owner) {
        Ok(region) => Ok(Some(region)),
        Err(ShgcError::RegionAllocationFailed { reason }) => {
            log::debug!("no {} region for thread {}: {}", kind, owner, reason);
            Ok(None)
        },
        Err(e) => Err(e),
    }
}

fn refill_young(heap: &Heap, thread: &MutatorThread, size: usize) -> Result<Option<usize>> {
    if let Some(region) = owned_region(heap, thread, thread.young_region(), SpaceKind::Young) {
        let top = region.top();
        if let Some(new_top) = top.checked_add(size).filter(|&t| t <= region.limit()) {
            region.publish_top(new_top);
            return Ok(Some(top));
        }
    }

    let region = match provision_or_none(heap, SpaceKind::Young, thread.id())? {
        Some(region) => region,
        None => return Ok(None),
    };
    thread.set_young_region(region.index());

    let top = region.top();
    region.publish_top(top + size);
    Ok(Some(top))
}

fn allocate_old(heap: &Heap, thread: &MutatorThread, size: usize) -> Result<Option<usize>> {
    if let Some(region) = owned_region(heap, thread, thread.old_region(), SpaceKind::Old) {
        if let Some(addr) = region.bump_shared(size) {
            return Ok(Some(addr));
        }
    }

    let region = match provision_or_none(heap, SpaceKind::Old, thread.id())? {
        Some(region) => region,
        None => return Ok(None),
    };
    thread.set_old_region(region.index());
    Ok(region.bump_shared(size))
}

fn allocate_huge(heap: &Heap, thread: &MutatorThread, size: usize) -> Result<Option<usize>> {
    match heap.provision_huge(thread.id(), size) {
        Ok(region) => {
            heap.stats().bump(Counter::HugeAllocation);
            Ok(region.bump_shared(size))
        },
        Err(ShgcError::RegionAllocationFailed { reason }) => {
            log::debug!("no huge span for {} bytes: {}", size, reason);
            Ok(None)
        },
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{allocate, NoCollector};
    use crate::config::ShgcConfig;
    use crate::runtime::safepoint::SuspendBarrier;
    use crate::stats::SubstrateStats;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const REGION: usize = 64 * 1024;

    fn setup(max_regions: usize) -> (Heap, MutatorThread) {
        let config = ShgcConfig {
            region_size: REGION,
            max_regions,
            max_shared_regions: 1,
            huge_threshold: REGION / 2,
            ..ShgcConfig::default()
        };
        let stats = Arc::new(SubstrateStats::default());
        let thread = MutatorThread::new(1, Arc::new(SuspendBarrier::new()), Arc::clone(&stats));
        thread.start().unwrap();
        (Heap::new(config, stats).unwrap(), thread)
    }

    #[test]
    fn test_first_young_allocation_provisions_region() {
        let (heap, thread) = setup(4);
        let a = allocate(&heap, &thread, Generation::Young, 24, &NoCollector).unwrap();
        let b = allocate(&heap, &thread, Generation::Young, 8, &NoCollector).unwrap();
        assert_eq!(b, a + 24);

        let snap = heap.stats().snapshot();
        assert_eq!(snap.slow_allocations, 1);
        assert_eq!(snap.fast_allocations, 1);
        assert_eq!(heap.region_of(a).unwrap().kind(), Some(SpaceKind::Young));
    }

    #[test]
    fn test_old_allocations_are_local_to_thread() {
        let (heap, thread) = setup(4);
        let a = allocate(&heap, &thread, Generation::Old, 64, &NoCollector).unwrap();
        let region = heap.region_of(a).unwrap();
        assert_eq!(region.kind(), Some(SpaceKind::Old));
        assert_eq!(region.owner(), thread.id());
    }

    #[test]
    fn test_huge_allocation_gets_its_own_span() {
        let (heap, thread) = setup(8);
        let addr = allocate(&heap, &thread, Generation::Young, REGION + 8, &NoCollector).unwrap();
        let region = heap.region_of(addr).unwrap();
        assert_eq!(region.kind(), Some(SpaceKind::Huge));
        assert_eq!(region.span(), 2);
        assert_eq!(addr, region.start());
        assert_eq!(heap.stats().snapshot().huge_allocations, 1);
    }

    #[test]
    fn test_exhaustion_asks_hook_once_then_fails() {
        struct Counting(AtomicUsize);
        impl CollectorHooks for Counting {
            fn on_allocation_failure(&self, _: &Heap, _: Generation, _: usize) -> bool {
                self.0.fetch_add(1, Ordering::SeqCst);
                true
            }
        }

        let (heap, thread) = setup(2);
        let hooks = Counting(AtomicUsize::new(0));
        allocate(&heap, &thread, Generation::SharedOld, 8, &hooks).unwrap();

        let err = allocate(&heap, &thread, Generation::SharedOld, REGION, &hooks).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(hooks.0.load(Ordering::SeqCst), 1);
        assert_eq!(heap.stats().snapshot().allocation_failures, 1);
    }

    #[test]
    fn test_hook_that_frees_a_region_rescues_allocation() {
        struct Releaser;
        impl CollectorHooks for Releaser {
            fn on_allocation_failure(&self, heap: &Heap, _: Generation, _: usize) -> bool {
                let mut victim = None;
                heap.for_each_region(|r| {
                    if r.kind() == Some(SpaceKind::Old) {
                        victim = Some(r.index());
                    }
                });
                victim.map_or(false, |i| heap.release_region(i).is_ok())
            }
        }

        let (heap, thread) = setup(1);
        allocate(&heap, &thread, Generation::Old, 8, &NoCollector).unwrap();
        thread.set_old_region(NO_REGION);

        let addr = allocate(&heap, &thread, Generation::Young, 8, &Releaser).unwrap();
        assert_eq!(heap.region_of(addr).unwrap().kind(), Some(SpaceKind::Young));
    }
}
