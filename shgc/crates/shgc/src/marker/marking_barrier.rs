//! Marking Barrier - Exposing Stored References to a Running Mark
//!
//! When concurrent marking is active, a reference stored into the heap may
//! be the only path to an object the marker has not reached yet. The
//! marking barrier greys it: set its mark bit and, if this call flipped
//! the bit, push it onto the collector's gray set.
//!
//! The mark-bit test-and-set makes the push happen exactly once per object
//! per cycle, no matter how many stores (or batched stores) expose it.
//!
//! Gray sets are lock-free multi-producer queues (`crossbeam::queue::SegQueue`):
//! many mutators push, the collector drains.

use crate::heap::region::Region;
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

/// GrayQueue - addresses waiting to be traced
pub struct GrayQueue {
    queue: SegQueue<usize>,
    pushed: AtomicUsize,
}

impl GrayQueue {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            pushed: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, addr: usize) {
        self.queue.push(addr);
        self.pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pop(&self) -> Option<usize> {
        self.queue.pop()
    }

    /// Take everything queued so far, in push order
    pub fn drain(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.queue.len());
        while let Some(addr) = self.queue.pop() {
            out.push(addr);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total pushes since creation
    pub fn pushed_count(&self) -> usize {
        self.pushed.load(Ordering::Relaxed)
    }
}

impl Default for GrayQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Grey `addr` (inside `region`) for the local heap's marker
///
/// Returns `true` when the object was newly pushed.
#[inline]
pub fn marking_barrier(region: &Region, addr: usize, gray: &GrayQueue) -> bool {
    if region.try_mark(addr) {
        log::trace!("marking barrier: greyed {:#x}", addr);
        gray.push(addr);
        true
    } else {
        false
    }
}

/// Grey `addr` (inside a shared sweepable region) for the shared marker
#[inline]
pub fn shared_marking_barrier(region: &Region, addr: usize, shared_gray: &GrayQueue) -> bool {
    debug_assert!(region.kind().map_or(false, |k| k.is_shared_sweepable()));
    if region.try_mark(addr) {
        log::trace!("shared marking barrier: greyed {:#x}", addr);
        shared_gray.push(addr);
        true
    } else {
        false
    }
}
