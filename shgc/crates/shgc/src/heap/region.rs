//! Region Implementation - Unit of Heap Bookkeeping
//!
//! A region is a fixed-size slice of the heap reservation. Descriptors are
//! preallocated, one per slice, and cycle through:
//!
//! ```text
//! Free ──activate(kind)──▶ InUse(kind) ──release()──▶ Free
//! ```
//!
//! Huge objects occupy a span of consecutive descriptors; the first one is
//! the head and owns the cursor, remembered sets and mark bit, the others
//! are tails pointing back at it.
//!
//! # Memory Ordering Model
//!
//! ## Kind / span / owner
//! - **Store:** `Release` in `activate`/`release`, which the heap only calls
//!   while holding its provisioning lock.
//! - **Load:** `Acquire`, so a barrier that resolves a region sees the
//!   cursor and sets initialised by `activate`.
//!
//! ## Allocation cursor (`top`)
//! - Young regions: single owner, plain `Acquire` load and `Release` store.
//! - Shared and old regions: `compare_exchange` loop.
//!
//! ## Remembered sets
//! - `parking_lot::RwLock<Option<Arc<RememberedSet>>>`; the read lock is the
//!   fast path once created, the write lock only guards creation and release.
//!
//! ## Mark bitmap
//! - `fetch_or` with `AcqRel` so exactly one marker wins a given object.

use crate::barrier::remembered_set::{RememberedSet, RememberedSetKind};
use crate::error::{Result, ShgcError};
use crate::heap::space::{SpaceKind, SPACE_FREE};
use crate::heap::SLOT_SIZE;
use crate::logging::{log_event, SubstrateEvent};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Region descriptor
pub struct Region {
    /// Position in the heap's descriptor table
    index: usize,

    /// Start address of this descriptor's slice
    start: usize,

    /// Bytes per descriptor
    size: usize,

    /// Encoded `SpaceKind`, `SPACE_FREE` when unused
    kind: AtomicU8,

    /// Descriptors covered by this region (1 unless Huge), 0 for tails
    span: AtomicUsize,

    /// Index of the head descriptor (self for heads)
    head: AtomicUsize,

    /// Owning mutator for local regions, 0 for shared or free
    owner: AtomicU32,

    /// Bump pointer
    top: AtomicUsize,

    /// Allocation limit
    limit: AtomicUsize,

    /// log2(slots per quad)
    quad_shift: u32,

    local_to_shared: RwLock<Option<Arc<RememberedSet>>>,
    old_to_new: RwLock<Option<Arc<RememberedSet>>>,

    /// One bit per slot of the head slice
    mark_bitmap: Box<[AtomicU64]>,
}

impl Region {
    pub(crate) fn new(index: usize, start: usize, size: usize, quad_shift: u32) -> Self {
        let bitmap_words = (size / SLOT_SIZE + 63) / 64;
        let mark_bitmap = (0..bitmap_words).map(|_| AtomicU64::new(0)).collect();

        Self {
            index,
            start,
            size,
            kind: AtomicU8::new(SPACE_FREE),
            span: AtomicUsize::new(0),
            head: AtomicUsize::new(index),
            owner: AtomicU32::new(0),
            top: AtomicUsize::new(start),
            limit: AtomicUsize::new(start),
            quad_shift,
            local_to_shared: RwLock::new(None),
            old_to_new: RwLock::new(None),
            mark_bitmap,
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle (heap provisioning lock held)
    // ------------------------------------------------------------------

    /// Put a free descriptor into use as the head of a `span`-long region
    pub(crate) fn activate(&self, kind: SpaceKind, owner: u32, span: usize) {
        debug_assert!(self.is_free(), "activating region {} twice", self.index);
        debug_assert!(self.local_to_shared.read().is_none());
        debug_assert!(self.old_to_new.read().is_none());

        self.clear_marks();
        self.top.store(self.start, Ordering::Relaxed);
        self.limit
            .store(self.start + span * self.size, Ordering::Relaxed);
        self.owner.store(owner, Ordering::Relaxed);
        self.head.store(self.index, Ordering::Relaxed);
        self.span.store(span, Ordering::Relaxed);
        self.kind.store(kind as u8, Ordering::Release);
    }

    /// Mark a descriptor as a tail of the huge region headed by `head`
    pub(crate) fn activate_tail(&self, head: usize) {
        debug_assert!(self.is_free());
        self.head.store(head, Ordering::Relaxed);
        self.span.store(0, Ordering::Relaxed);
        self.kind.store(SpaceKind::Huge as u8, Ordering::Release);
    }

    /// Return the descriptor to the free pool
    ///
    /// Remembered sets are dropped together with the region.
    pub(crate) fn release(&self) {
        self.local_to_shared.write().take();
        self.old_to_new.write().take();
        self.owner.store(0, Ordering::Relaxed);
        self.span.store(0, Ordering::Relaxed);
        self.head.store(self.index, Ordering::Relaxed);
        self.top.store(self.start, Ordering::Relaxed);
        self.limit.store(self.start, Ordering::Relaxed);
        self.kind.store(SPACE_FREE, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn start(&self) -> usize {
        self.start
    }

    /// End of the whole span (exclusive)
    pub fn end(&self) -> usize {
        self.start + self.span().max(1) * self.size
    }

    pub fn span(&self) -> usize {
        self.span.load(Ordering::Acquire)
    }

    /// Bytes covered by the region including huge tails
    pub fn byte_size(&self) -> usize {
        self.span().max(1) * self.size
    }

    #[inline]
    pub fn kind(&self) -> Option<SpaceKind> {
        SpaceKind::from_u8(self.kind.load(Ordering::Acquire))
    }

    pub fn is_free(&self) -> bool {
        self.kind.load(Ordering::Acquire) == SPACE_FREE
    }

    pub(crate) fn head_index(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    pub(crate) fn is_tail(&self) -> bool {
        !self.is_free() && self.head_index() != self.index
    }

    /// log2 of slots per remembered-set quad
    pub fn quad_shift(&self) -> u32 {
        self.quad_shift
    }

    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Relaxed)
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    // ------------------------------------------------------------------
    // Allocation cursor
    // ------------------------------------------------------------------

    #[inline]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    /// Publish a new top (single-owner cursors only)
    #[inline]
    pub(crate) fn publish_top(&self, new_top: usize) {
        debug_assert!(new_top <= self.limit());
        self.top.store(new_top, Ordering::Release);
    }

    /// Thread-safe bump of `size` bytes, `None` when the region is full
    pub(crate) fn bump_shared(&self, size: usize) -> Option<usize> {
        let limit = self.limit();
        let mut current = self.top.load(Ordering::Relaxed);
        loop {
            let new_top = current.checked_add(size)?;
            if new_top > limit {
                return None;
            }
            match self.top.compare_exchange_weak(
                current,
                new_top,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn remaining(&self) -> usize {
        self.limit().saturating_sub(self.top())
    }

    pub fn used_bytes(&self) -> usize {
        self.top().saturating_sub(self.start)
    }

    // ------------------------------------------------------------------
    // Remembered sets
    // ------------------------------------------------------------------

    fn set_slot(&self, kind: RememberedSetKind) -> &RwLock<Option<Arc<RememberedSet>>> {
        match kind {
            RememberedSetKind::LocalToShared => &self.local_to_shared,
            RememberedSetKind::OldToNew => &self.old_to_new,
        }
    }

    /// Existing remembered set of `kind`, if any
    pub fn remembered_set(&self, kind: RememberedSetKind) -> Option<Arc<RememberedSet>> {
        self.set_slot(kind).read().clone()
    }

    /// Get-or-create the remembered set of `kind`
    ///
    /// # Returns
    /// * `Err(ShgcError::OutOfMemory)` - the zero-filled bitmap could not be
    ///   reserved
    /// * `Err(ShgcError::Internal)` - the region's kind never owns this set
    pub fn ensure_remembered_set(&self, kind: RememberedSetKind) -> Result<Arc<RememberedSet>> {
        let slot = self.set_slot(kind);
        if let Some(set) = slot.read().as_ref() {
            return Ok(Arc::clone(set));
        }

        let space = self.kind().ok_or(ShgcError::InvalidPointer {
            address: self.start,
        })?;
        let allowed = match kind {
            RememberedSetKind::LocalToShared => space.may_own_local_to_shared(),
            RememberedSetKind::OldToNew => space.may_own_old_to_new(),
        };
        if !allowed {
            return Err(ShgcError::Internal(format!(
                "{} region {} cannot own a {:?} remembered set",
                space, self.index, kind
            )));
        }

        let mut guard = slot.write();
        if let Some(set) = guard.as_ref() {
            return Ok(Arc::clone(set));
        }

        let set = Arc::new(RememberedSet::new(
            self.start,
            self.byte_size(),
            self.quad_shift,
        )?);
        *guard = Some(Arc::clone(&set));
        drop(guard);

        log::trace!(
            "created {:?} remembered set for {} region {} ({} quads)",
            kind,
            space,
            self.index,
            set.quad_count()
        );
        log_event(SubstrateEvent::RememberedSetCreated {
            region: self.index,
            kind: format!("{:?}", kind),
        });
        Ok(set)
    }

    /// Clear the bits of one remembered set, keeping its storage
    ///
    /// Collector only.
    pub fn clear_remembered_set(&self, kind: RememberedSetKind) {
        if let Some(set) = self.set_slot(kind).read().as_ref() {
            set.clear_all();
        }
    }

    // ------------------------------------------------------------------
    // Mark bitmap
    // ------------------------------------------------------------------

    fn mark_position(&self, addr: usize) -> Option<(usize, u64)> {
        if addr < self.start || addr >= self.start + self.size {
            return None;
        }
        let slot = (addr - self.start) / SLOT_SIZE;
        Some((slot / 64, 1u64 << (slot % 64)))
    }

    /// Set the mark bit of the object at `addr`
    ///
    /// Returns `true` only for the caller that flipped the bit.
    pub fn try_mark(&self, addr: usize) -> bool {
        match self.mark_position(addr) {
            Some((word, mask)) => {
                self.mark_bitmap[word].fetch_or(mask, Ordering::AcqRel) & mask == 0
            }
            None => {
                log::warn!(
                    "try_mark: address {:#x} outside region {} [{:#x}, {:#x})",
                    addr,
                    self.index,
                    self.start,
                    self.start + self.size
                );
                false
            }
        }
    }

    pub fn is_marked(&self, addr: usize) -> bool {
        match self.mark_position(addr) {
            Some((word, mask)) => self.mark_bitmap[word].load(Ordering::Acquire) & mask != 0,
            None => false,
        }
    }

    /// Reset all mark bits for a new cycle
    pub fn clear_marks(&self) {
        for word in self.mark_bitmap.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("index", &self.index)
            .field("kind", &self.kind())
            .field("start", &format_args!("{:#x}", self.start))
            .field("top", &format_args!("{:#x}", self.top()))
            .field("limit", &format_args!("{:#x}", self.limit()))
            .field("owner", &self.owner())
            .finish()
    }
}
