//! Write Barrier - Single-Slot Store
//!
//! Every store of a value into a heap slot goes through `store`. Which
//! barrier a store site needs is decided when the site is compiled and
//! passed in as a [`BarrierPolicy`]:
//!
//! ```text
//! NoBarrier       value is statically never a heap object (int, double,
//!                 special), raw store only
//! NeedBarrier     value is statically a heap object, always take the barrier
//! UnknownBarrier  one mask test on the stored value decides at run time
//! ```
//!
//! The barrier itself (`set_value_with_barrier`) keeps two invariants for
//! the local collector and feeds the concurrent markers:
//!
//! ```text
//! containing \ target │ Young       │ Old/Huge │ SharedOld / SharedNonMovable
//! ────────────────────┼─────────────┼──────────┼─────────────────────────────
//! Young               │ -           │ -        │ LocalToShared
//! Old / Huge          │ OldToNew    │ -        │ LocalToShared
//! SharedOld / NonMov. │ -           │ -        │ -
//! ```
//!
//! Independently of that table, one acquire load of the thread's interrupt
//! word decides the two marking triggers:
//! - local marking is `Marking` and the target is not shared: grey it locally
//! - shared marking is active and the target is shared sweepable: grey it
//!   for the shared marker

use crate::barrier::remembered_set::RememberedSetKind;
use crate::error::{Result, ShgcError};
use crate::heap::{Heap, Region, SpaceKind};
use crate::marker::{marking_barrier, shared_marking_barrier, InterruptBits};
use crate::stats::Counter;
use crate::thread::MutatorThread;
use crate::value::TaggedValue;

/// Barrier requirement of a store site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierPolicy {
    /// Raw store, no barrier
    NoBarrier,
    /// Always run the barrier
    NeedBarrier,
    /// Run the barrier iff the stored value is a heap object
    UnknownBarrier,
}

/// What the compiler knows about a stored value's type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Int,
    Double,
    Special,
    HeapObject,
    Unknown,
}

impl BarrierPolicy {
    /// Policy a store site gets for a value of static kind `kind`
    pub fn classify(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Int | ValueKind::Double | ValueKind::Special => BarrierPolicy::NoBarrier,
            ValueKind::HeapObject => BarrierPolicy::NeedBarrier,
            ValueKind::Unknown => BarrierPolicy::UnknownBarrier,
        }
    }
}

/// Store `value` into `object + offset` under `policy`
///
/// The raw store happens first; the barrier then records the slot and
/// greys the value as needed.
///
/// # Arguments
/// * `heap` - heap holding both the slot and the value's target
/// * `thread` - storing mutator (interrupt word and local gray set)
/// * `object` - address of the containing object
/// * `offset` - byte offset of the slot inside the object
/// * `value` - value to store
/// * `policy` - compile-time barrier decision
///
/// # Returns
/// * `Err(ShgcError::InvalidPointer)` - slot or target outside a live region
/// * `Err(ShgcError::OutOfMemory)` - a remembered set could not be created
#[inline]
pub fn store(
    heap: &Heap,
    thread: &MutatorThread,
    object: usize,
    offset: usize,
    value: TaggedValue,
    policy: BarrierPolicy,
) -> Result<()> {
    let slot_addr = object
        .checked_add(offset)
        .ok_or(ShgcError::InvalidPointer { address: object })?;

    heap.write_slot(slot_addr, value)?;
    heap.stats().bump(Counter::Store);

    match policy {
        BarrierPolicy::NoBarrier => Ok(()),
        BarrierPolicy::NeedBarrier => set_value_with_barrier(heap, thread, slot_addr, value),
        BarrierPolicy::UnknownBarrier => {
            if value.is_heap_object() {
                set_value_with_barrier(heap, thread, slot_addr, value)
            } else {
                Ok(())
            }
        },
    }
}

/// Barrier for a slot that now holds `value`
///
/// Non-heap values are ignored, so a `NeedBarrier` site that stores a
/// special value is harmless.
pub fn set_value_with_barrier(
    heap: &Heap,
    thread: &MutatorThread,
    slot_addr: usize,
    value: TaggedValue,
) -> Result<()> {
    let target_addr = match value.heap_address() {
        Some(addr) => addr,
        None => return Ok(()),
    };

    let containing = heap
        .region_of(slot_addr)
        .ok_or(ShgcError::InvalidPointer { address: slot_addr })?;
    let target = heap
        .region_of(target_addr)
        .ok_or(ShgcError::InvalidPointer {
            address: target_addr,
        })?;
    let containing_kind = space_of(containing)?;
    let target_kind = space_of(target)?;

    heap.stats().bump(Counter::BarrierSlowCall);

    if !containing_kind.is_shared() {
        if target_kind.is_shared_sweepable() {
            containing
                .ensure_remembered_set(RememberedSetKind::LocalToShared)?
                .insert(slot_addr);
            heap.stats().bump(Counter::LocalToSharedInsert);
        }
        if containing_kind.may_own_old_to_new() && target_kind.is_young() {
            containing
                .ensure_remembered_set(RememberedSetKind::OldToNew)?
                .insert(slot_addr);
            heap.stats().bump(Counter::OldToNewInsert);
        }
    }

    let bits = thread.interrupt().load();
    fire_marking_triggers(heap, thread, bits, target, target_kind, target_addr);
    Ok(())
}

/// Run whichever marking triggers `bits` enables for one target
#[inline]
pub(crate) fn fire_marking_triggers(
    heap: &Heap,
    thread: &MutatorThread,
    bits: InterruptBits,
    target: &Region,
    target_kind: SpaceKind,
    target_addr: usize,
) {
    if bits.is_local_marking()
        && !target_kind.is_shared()
        && marking_barrier(target, target_addr, thread.gray())
    {
        heap.stats().bump(Counter::LocalMarkPush);
    }
    if bits.is_shared_marking()
        && target_kind.is_shared_sweepable()
        && shared_marking_barrier(target, target_addr, heap.shared_gray())
    {
        heap.stats().bump(Counter::SharedMarkPush);
    }
}

#[inline]
pub(crate) fn space_of(region: &Region) -> Result<SpaceKind> {
    region.kind().ok_or(ShgcError::InvalidPointer {
        address: region.start(),
    })
}
