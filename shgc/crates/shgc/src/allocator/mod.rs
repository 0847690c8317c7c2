//! Allocator Module - Allocation Fast Path and Runtime Allocator
//!
//! ## Allocation Flow
//!
//! 1. Round the request up to a whole number of slots
//! 2. Young and not huge: bump the thread's young region inline
//!    (`fast_path`), no atomics beyond one release store
//! 3. Anything else, or a full young region: runtime allocator call
//!    (`runtime_call`), which is a safepoint
//! 4. Runtime allocator out of regions: ask the collector hook once, retry
//!    once, then fail with `OutOfMemory`

pub mod fast_path;
pub mod runtime_call;

pub use fast_path::{allocate, allocate_young_inline};
pub use runtime_call::runtime_allocate;

use crate::error::{Result, ShgcError};
use crate::heap::{Generation, Heap, SLOT_SIZE};

/// Collector callbacks the substrate invokes
pub trait CollectorHooks: Send + Sync {
    /// The runtime allocator could not place `size` bytes in `generation`
    ///
    /// Called at most once per allocation. Return `true` if memory may
    /// have been reclaimed and the allocation should be retried.
    fn on_allocation_failure(&self, heap: &Heap, generation: Generation, size: usize) -> bool {
        let _ = (heap, generation, size);
        false
    }
}

/// Hooks that never reclaim anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCollector;

impl CollectorHooks for NoCollector {}

/// Round `size` up to a whole number of slots
///
/// # Returns
/// * `Err(ShgcError::InvalidArgument)` - zero-sized request
/// * `Err(ShgcError::OutOfMemory)` - rounding overflows
#[inline]
pub fn align_size(size: usize) -> Result<usize> {
    if size == 0 {
        return Err(ShgcError::InvalidArgument(
            "allocation size must be non-zero".to_string(),
        ));
    }
    size.checked_add(SLOT_SIZE - 1)
        .map(|s| s & !(SLOT_SIZE - 1))
        .ok_or(ShgcError::OutOfMemory {
            requested: size,
            available: 0,
        })
}
