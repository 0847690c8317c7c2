//! Fast Path - Inline Young Bump Allocation
//!
//! What generated code inlines at a young allocation site:
//!
//! ```text
//! top     = region.top          (acquire)
//! limit   = region.limit
//! new_top = top + size
//! if new_top > limit  -> runtime allocator call
//! region.top = new_top          (release)
//! return top
//! ```
//!
//! The young region is owned by exactly one mutator, so no CAS is needed.
//! A cursor whose region was released (or handed to someone else) is
//! rejected before the bump.
//! A request of exactly the remaining bytes succeeds; one more slot falls
//! back to the runtime call.

use crate::allocator::runtime_call::runtime_allocate;
use crate::allocator::{align_size, CollectorHooks};
use crate::error::Result;
use crate::heap::{Generation, Heap, SpaceKind, NO_REGION};
use crate::stats::Counter;
use crate::thread::MutatorThread;

/// Inline bump in the thread's current young region
///
/// `size` must already be slot aligned. Returns `None` when the caller has
/// to take the runtime allocator call.
#[inline(always)]
pub fn allocate_young_inline(heap: &Heap, thread: &MutatorThread, size: usize) -> Option<usize> {
    let index = thread.young_region();
    if index == NO_REGION {
        return None;
    }
    let region = heap.region_at(index)?;
    // The cursor goes stale once the collector releases the region.
    if region.owner() != thread.id() || region.kind() != Some(SpaceKind::Young) {
        return None;
    }

    let top = region.top();
    let limit = region.limit();
    let new_top = top.checked_add(size)?;
    if new_top > limit {
        return None;
    }
    region.publish_top(new_top);
    Some(top)
}

/// Allocate `size` bytes in `generation` for `thread`
///
/// Young requests up to the huge threshold try the inline path first;
/// everything else goes straight to the runtime allocator.
///
/// # Returns
/// * `Err(ShgcError::OutOfMemory)` - no space even after the collector hook
/// * `Err(ShgcError::ThreadTerminated)` - the thread was terminated while
///   parked in the runtime call
pub fn allocate(
    heap: &Heap,
    thread: &MutatorThread,
    generation: Generation,
    size: usize,
    hooks: &dyn CollectorHooks,
) -> Result<usize> {
    let size = align_size(size)?;

    if generation == Generation::Young && size <= heap.config().huge_threshold {
        if let Some(addr) = allocate_young_inline(heap, thread, size) {
            heap.stats().bump(Counter::FastAllocation);
            return Ok(addr);
        }
    }
    runtime_allocate(heap, thread, generation, size, hooks)
}
