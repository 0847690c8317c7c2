//! Heap Management Module - Region Table over One Reservation
//!
//! The heap reserves a single anonymous mapping up front and slices it into
//! equally sized regions. Every slice has a preallocated descriptor, so the
//! region owning any heap address is one subtraction and one shift away:
//!
//! ```text
//! base                                                       base + N*size
//! ┌──────────┬──────────┬──────────┬──────────┬─────────────┬──────────┐
//! │ Region 0 │ Region 1 │ Region 2 │ Region 3 │     ...     │ Region N │
//! │ (Young)  │ (Old)    │ (Huge)   │ (tail)   │             │ (Free)   │
//! └──────────┴──────────┴──────────┴──────────┴─────────────┴──────────┘
//! region_of(addr) = descriptors[(addr - base) >> region_shift]
//! ```
//!
//! Local regions (Young, Old, Huge) belong to one mutator; shared regions
//! (SharedOld, SharedNonMovable) are bump-allocated by every mutator through
//! a CAS on the current shared region, switching regions under a lock.
//!
//! Slots are 8-byte words holding `TaggedValue`s and are accessed as
//! atomics, so a racing collector never observes a torn reference.

pub mod region;
pub mod space;

pub use region::Region;
pub use space::{Generation, SpaceKind};

use crate::config::ShgcConfig;
use crate::error::{Result, ShgcError};
use crate::logging::{log_event, SubstrateEvent};
use crate::marker::GrayQueue;
use crate::stats::SubstrateStats;
use crate::value::TaggedValue;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Bytes per heap slot
pub const SLOT_SIZE: usize = 8;

/// Sentinel for "no current region"
pub(crate) const NO_REGION: usize = usize::MAX;

/// Bookkeeping guarded by the provisioning lock
#[derive(Debug, Default)]
struct ProvisionState {
    /// Descriptors in use, tails included
    in_use: usize,

    /// Shared regions in use
    shared_in_use: usize,

    /// Where the next free-descriptor scan starts
    next_hint: usize,
}

/// Heap - region table and slot access
pub struct Heap {
    config: ShgcConfig,

    /// Keeps the reservation alive; never accessed through a `&mut`
    _mapping: MmapMut,

    base: usize,
    size: usize,
    region_shift: u32,

    regions: Box<[Region]>,

    provision: Mutex<ProvisionState>,

    /// Current allocation region per shared space (SharedOld, SharedNonMovable)
    shared_current: [AtomicUsize; 2],

    /// Serialises replacement of a full shared region
    shared_switch: Mutex<()>,

    /// Gray set of the shared heap's marker
    shared_gray: GrayQueue,

    stats: Arc<SubstrateStats>,
}

impl Heap {
    /// Reserve the heap described by `config`
    ///
    /// # Returns
    /// * `Err(ShgcError::Configuration)` - `config` failed validation
    /// * `Err(ShgcError::HeapInitialization)` - the reservation was refused
    pub fn new(config: ShgcConfig, stats: Arc<SubstrateStats>) -> Result<Self> {
        config.validate()?;

        let size = config.reservation_size();
        let mapping = MmapOptions::new().len(size).map_anon().map_err(|e| {
            ShgcError::HeapInitialization(format!(
                "failed to reserve {} bytes: {}",
                size, e
            ))
        })?;
        let base = mapping.as_ptr() as usize;

        let region_shift = config.region_size.trailing_zeros();
        let quad_shift = config.quad_shift();
        let regions: Box<[Region]> = (0..config.max_regions)
            .map(|i| Region::new(i, base + i * config.region_size, config.region_size, quad_shift))
            .collect();

        log::debug!(
            "heap reserved at {:#x}: {} regions of {} bytes",
            base,
            config.max_regions,
            config.region_size
        );

        Ok(Self {
            config,
            _mapping: mapping,
            base,
            size,
            region_shift,
            regions,
            provision: Mutex::new(ProvisionState::default()),
            shared_current: [AtomicUsize::new(NO_REGION), AtomicUsize::new(NO_REGION)],
            shared_switch: Mutex::new(()),
            shared_gray: GrayQueue::new(),
            stats,
        })
    }

    pub fn config(&self) -> &ShgcConfig {
        &self.config
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn reservation_size(&self) -> usize {
        self.size
    }

    pub fn region_size(&self) -> usize {
        self.config.region_size
    }

    pub fn stats(&self) -> &Arc<SubstrateStats> {
        &self.stats
    }

    pub fn shared_gray(&self) -> &GrayQueue {
        &self.shared_gray
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    // ------------------------------------------------------------------
    // Region lookup
    // ------------------------------------------------------------------

    pub fn region_at(&self, index: usize) -> Option<&Region> {
        self.regions.get(index)
    }

    /// Region owning `addr`, resolved to the head for huge tails
    ///
    /// Returns `None` for addresses outside the reservation or inside a
    /// free region.
    #[inline]
    pub fn region_of(&self, addr: usize) -> Option<&Region> {
        if !self.contains(addr) {
            return None;
        }
        let region = &self.regions[(addr - self.base) >> self.region_shift];
        if region.is_free() {
            return None;
        }
        if region.is_tail() {
            return self.regions.get(region.head_index());
        }
        Some(region)
    }

    /// Visit every region head in use
    pub fn for_each_region<F: FnMut(&Region)>(&self, mut visit: F) {
        for region in self.regions.iter() {
            if !region.is_free() && !region.is_tail() {
                visit(region);
            }
        }
    }

    pub fn regions_in_use(&self) -> usize {
        self.provision.lock().in_use
    }

    pub fn free_region_count(&self) -> usize {
        self.regions.len() - self.regions_in_use()
    }

    // ------------------------------------------------------------------
    // Slot access
    // ------------------------------------------------------------------

    /// Atomic view of the slot at `addr`
    ///
    /// # Returns
    /// * `Err(ShgcError::AlignmentError)` - `addr` is not slot aligned
    /// * `Err(ShgcError::InvalidPointer)` - `addr` is not in a live region
    pub fn slot(&self, addr: usize) -> Result<&AtomicU64> {
        if addr % SLOT_SIZE != 0 {
            return Err(ShgcError::AlignmentError {
                address: addr,
                alignment: SLOT_SIZE,
            });
        }
        if self.region_of(addr).is_none() {
            return Err(ShgcError::InvalidPointer { address: addr });
        }
        // SAFETY: addr is 8-aligned and inside the live mapping, which is
        // only ever accessed through atomics after construction.
        Ok(unsafe { &*(addr as *const AtomicU64) })
    }

    pub fn read_slot(&self, addr: usize) -> Result<TaggedValue> {
        Ok(TaggedValue::from_raw(self.slot(addr)?.load(Ordering::Relaxed)))
    }

    /// Raw store, no barrier
    pub fn write_slot(&self, addr: usize, value: TaggedValue) -> Result<()> {
        self.slot(addr)?.store(value.raw(), Ordering::Relaxed);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Provisioning
    // ------------------------------------------------------------------

    fn zero_range(&self, start: usize, bytes: usize) {
        debug_assert!(self.contains(start) && self.contains(start + bytes - 1));
        // SAFETY: the range is inside the mapping and belongs to descriptors
        // being activated under the provisioning lock, so nothing reads it.
        unsafe { std::ptr::write_bytes(start as *mut u8, 0, bytes) };
    }

    fn find_free_run(&self, state: &ProvisionState, span: usize) -> Option<usize> {
        let count = self.regions.len();
        if span == 0 || span > count {
            return None;
        }
        let mut run = 0;
        let mut start = 0;
        // Two passes from the hint wrap around the table once.
        for step in 0..count + span {
            let i = (state.next_hint + step) % count;
            if i == 0 && run > 0 {
                run = 0;
            }
            if self.regions[i].is_free() {
                if run == 0 {
                    start = i;
                }
                run += 1;
                if run == span {
                    return Some(start);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Put a free region into use as `kind`
    ///
    /// # Returns
    /// * `Err(ShgcError::RegionAllocationFailed)` - no free descriptor, or
    ///   the shared region cap is reached
    pub fn provision_region(&self, kind: SpaceKind, owner: u32) -> Result<&Region> {
        debug_assert!(kind != SpaceKind::Huge, "huge regions go through provision_huge");
        let mut state = self.provision.lock();

        if kind.is_shared() && state.shared_in_use >= self.config.max_shared_regions {
            return Err(ShgcError::RegionAllocationFailed {
                reason: format!(
                    "shared region cap of {} reached",
                    self.config.max_shared_regions
                ),
            });
        }

        let index = self
            .find_free_run(&state, 1)
            .ok_or_else(|| ShgcError::RegionAllocationFailed {
                reason: format!("all {} regions in use", self.regions.len()),
            })?;

        let region = &self.regions[index];
        self.zero_range(region.start(), self.config.region_size);
        region.activate(kind, if kind.is_shared() { 0 } else { owner }, 1);

        state.in_use += 1;
        if kind.is_shared() {
            state.shared_in_use += 1;
        }
        state.next_hint = (index + 1) % self.regions.len();
        drop(state);

        log::debug!("provisioned {} region {} for thread {}", kind, index, owner);
        log_event(SubstrateEvent::RegionProvisioned {
            region: index,
            kind: kind.to_string(),
            span: 1,
        });
        Ok(region)
    }

    /// Provision a Huge region large enough for `bytes`
    pub fn provision_huge(&self, owner: u32, bytes: usize) -> Result<&Region> {
        let span = (bytes + self.config.region_size - 1) / self.config.region_size;
        let mut state = self.provision.lock();

        let head = self
            .find_free_run(&state, span.max(1))
            .ok_or_else(|| ShgcError::RegionAllocationFailed {
                reason: format!("no run of {} free regions for {} bytes", span, bytes),
            })?;

        let region = &self.regions[head];
        self.zero_range(region.start(), span * self.config.region_size);
        for tail in head + 1..head + span {
            self.regions[tail].activate_tail(head);
        }
        region.activate(SpaceKind::Huge, owner, span);

        state.in_use += span;
        state.next_hint = (head + span) % self.regions.len();
        drop(state);

        log::debug!(
            "provisioned huge region {} spanning {} descriptors for thread {}",
            head,
            span,
            owner
        );
        log_event(SubstrateEvent::RegionProvisioned {
            region: head,
            kind: SpaceKind::Huge.to_string(),
            span,
        });
        Ok(region)
    }

    /// Return a region (and its huge tails) to the free pool
    ///
    /// Its remembered sets are dropped with it. Collector only: the caller
    /// guarantees no mutator still allocates into or stores through it.
    pub fn release_region(&self, index: usize) -> Result<()> {
        let region = self
            .regions
            .get(index)
            .ok_or(ShgcError::BoundsCheckFailed {
                index,
                length: self.regions.len(),
            })?;

        let mut state = self.provision.lock();
        let kind = match region.kind() {
            Some(kind) if !region.is_tail() => kind,
            _ => {
                return Err(ShgcError::InvalidArgument(format!(
                    "region {} is not an in-use region head",
                    index
                )))
            },
        };

        let span = region.span().max(1);
        for tail in index + 1..index + span {
            self.regions[tail].release();
        }
        region.release();

        state.in_use -= span;
        if kind.is_shared() {
            state.shared_in_use -= 1;
            if let Some(cursor) = self.shared_cursor(kind) {
                let _ = cursor.compare_exchange(index, NO_REGION, Ordering::AcqRel, Ordering::Relaxed);
            }
        }
        drop(state);

        log::debug!("released {} region {} (span {})", kind, index, span);
        Ok(())
    }

    /// Release every local region owned by `owner`
    pub fn release_owned_by(&self, owner: u32) -> usize {
        let mut owned = Vec::new();
        self.for_each_region(|region| {
            if region.owner() == owner && !region.kind().map_or(true, |k| k.is_shared()) {
                owned.push(region.index());
            }
        });
        let mut released = 0;
        for index in owned {
            match self.release_region(index) {
                Ok(()) => released += 1,
                // Lost a race with another release of the same region.
                Err(e) => log::warn!("owner {}: region {} not released: {}", owner, index, e),
            }
        }
        released
    }

    // ------------------------------------------------------------------
    // Shared allocation
    // ------------------------------------------------------------------

    fn shared_cursor(&self, kind: SpaceKind) -> Option<&AtomicUsize> {
        match kind {
            SpaceKind::SharedOld => Some(&self.shared_current[0]),
            SpaceKind::SharedNonMovable => Some(&self.shared_current[1]),
            _ => None,
        }
    }

    fn try_bump_current(&self, cursor: &AtomicUsize, size: usize) -> Option<usize> {
        let index = cursor.load(Ordering::Acquire);
        if index == NO_REGION {
            return None;
        }
        self.regions[index].bump_shared(size)
    }

    /// Bump-allocate `size` bytes in the shared space `kind`
    ///
    /// Lock-free while the current region has room. Switching to a fresh
    /// region happens under `shared_switch`, so only one thread replaces
    /// the cursor.
    ///
    /// # Returns
    /// * `Ok(None)` - the shared space is exhausted
    pub fn allocate_shared(&self, kind: SpaceKind, size: usize) -> Result<Option<usize>> {
        let cursor = self.shared_cursor(kind).ok_or_else(|| {
            ShgcError::InvalidArgument(format!("{} is not a shared space", kind))
        })?;

        if size > self.config.region_size {
            return Ok(None);
        }

        if let Some(addr) = self.try_bump_current(cursor, size) {
            return Ok(Some(addr));
        }

        let _switch = self.shared_switch.lock();

        // Another thread may have switched while we waited.
        if let Some(addr) = self.try_bump_current(cursor, size) {
            return Ok(Some(addr));
        }

        let region = match self.provision_region(kind, 0) {
            Ok(region) => region,
            Err(ShgcError::RegionAllocationFailed { reason }) => {
                log::warn!("shared {} allocation of {} bytes failed: {}", kind, size, reason);
                return Ok(None);
            },
            Err(e) => return Err(e),
        };
        let addr = region.bump_shared(size);
        cursor.store(region.index(), Ordering::Release);
        Ok(addr)
    }

    // ------------------------------------------------------------------
    // Collector helpers
    // ------------------------------------------------------------------

    /// Reset mark bits in every region for a new cycle
    pub fn clear_all_marks(&self) {
        self.for_each_region(|region| region.clear_marks());
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .field("regions", &self.regions.len())
            .field("in_use", &self.regions_in_use())
            .finish()
    }
}
