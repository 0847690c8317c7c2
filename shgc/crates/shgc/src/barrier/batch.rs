//! Batched Write Barrier - Bulk Stores
//!
//! After a bulk copy or fill of `count` consecutive slots, running the
//! single-slot barrier per slot would hit the remembered set once per
//! reference. The batched barrier instead walks the slots once and keeps
//! one accumulator per remembered-set kind:
//!
//! ```text
//! slot ──▶ (word, mask) ──▶ same word as accumulator? ── yes ──▶ mask |= bit
//!                                     │
//!                                     no
//!                                     ▼
//!                      flush accumulator into the set, start new word
//! ```
//!
//! Each accumulator is flushed exactly once per word change and once at
//! the end, so the persistent set sees one `fetch_or` per touched word.
//! The result is bit-for-bit what the single-slot barrier would produce.
//!
//! Marking is a separate pass (`handle_mark`) run only when either marking
//! flag is up; it fires the same per-slot triggers as a single store.

use crate::barrier::remembered_set::{RememberedSet, RememberedSetKind};
use crate::barrier::write_barrier::{fire_marking_triggers, space_of};
use crate::error::{Result, ShgcError};
use crate::heap::{Heap, Region, SLOT_SIZE};
use crate::stats::Counter;
use crate::thread::MutatorThread;
use std::sync::Arc;

/// One pending bit word for one remembered-set kind
struct WordAccumulator {
    kind: RememberedSetKind,
    word: usize,
    mask: u64,
    set: Option<Arc<RememberedSet>>,
    flushes: u64,
}

impl WordAccumulator {
    fn new(kind: RememberedSetKind) -> Self {
        Self {
            kind,
            word: 0,
            mask: 0,
            set: None,
            flushes: 0,
        }
    }

    #[inline]
    fn add(&mut self, region: &Region, word: usize, mask: u64) -> Result<()> {
        if self.mask != 0 && word != self.word {
            self.flush(region)?;
        }
        self.word = word;
        self.mask |= mask;
        Ok(())
    }

    fn flush(&mut self, region: &Region) -> Result<()> {
        if self.mask == 0 {
            return Ok(());
        }
        if self.set.is_none() {
            self.set = Some(region.ensure_remembered_set(self.kind)?);
        }
        if let Some(set) = &self.set {
            set.set_quad(self.word, self.mask);
        }
        self.mask = 0;
        self.flushes += 1;
        Ok(())
    }
}

/// Check that `[dst, dst + count slots)` lies inside one live region
fn containing_region(heap: &Heap, dst: usize, count: usize) -> Result<&Region> {
    if dst % SLOT_SIZE != 0 {
        return Err(ShgcError::AlignmentError {
            address: dst,
            alignment: SLOT_SIZE,
        });
    }
    let region = heap
        .region_of(dst)
        .ok_or(ShgcError::InvalidPointer { address: dst })?;
    let last = count
        .checked_sub(1)
        .and_then(|n| n.checked_mul(SLOT_SIZE))
        .and_then(|bytes| dst.checked_add(bytes))
        .ok_or(ShgcError::InvalidPointer { address: dst })?;
    if !region.contains(last) {
        return Err(ShgcError::BoundsCheckFailed {
            index: count,
            length: (region.end() - dst) / SLOT_SIZE,
        });
    }
    Ok(region)
}

/// Barrier for `count` consecutive slots starting at `dst`
///
/// The slots must already hold their new values.
///
/// # Returns
/// * `Err(ShgcError::InvalidPointer)` - a slot or a stored reference is
///   outside a live region
/// * `Err(ShgcError::BoundsCheckFailed)` - the range crosses its region
/// * `Err(ShgcError::OutOfMemory)` - a remembered set could not be created
pub fn barrier_batch_bitset(
    heap: &Heap,
    thread: &MutatorThread,
    dst: usize,
    count: usize,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    let containing = containing_region(heap, dst, count)?;
    let containing_kind = space_of(containing)?;
    heap.stats().bump(Counter::BatchBarrier);

    if !containing_kind.is_shared() {
        let start = containing.start();
        let quad_shift = containing.quad_shift();
        let track_old_to_new = containing_kind.may_own_old_to_new();

        let mut local_to_shared = WordAccumulator::new(RememberedSetKind::LocalToShared);
        let mut old_to_new = WordAccumulator::new(RememberedSetKind::OldToNew);

        for i in 0..count {
            let slot = dst + i * SLOT_SIZE;
            let target_addr = match heap.read_slot(slot)?.heap_address() {
                Some(addr) => addr,
                None => continue,
            };
            let target = heap.region_of(target_addr).ok_or(ShgcError::InvalidPointer {
                address: target_addr,
            })?;
            let target_kind = space_of(target)?;

            if target_kind.is_shared_sweepable() {
                let (word, mask) = RememberedSet::quad_position(start, quad_shift, slot);
                local_to_shared.add(containing, word, mask)?;
            }
            if track_old_to_new && target_kind.is_young() {
                let (word, mask) = RememberedSet::quad_position(start, quad_shift, slot);
                old_to_new.add(containing, word, mask)?;
            }
        }

        local_to_shared.flush(containing)?;
        old_to_new.flush(containing)?;
        heap.stats()
            .add(Counter::LocalToSharedInsert, local_to_shared.flushes);
        heap.stats().add(Counter::OldToNewInsert, old_to_new.flushes);
    }

    handle_mark(heap, thread, dst, count)
}

/// Marking pass of the batched barrier
///
/// Reads the interrupt word once; does nothing unless a marking trigger
/// can fire.
pub fn handle_mark(heap: &Heap, thread: &MutatorThread, dst: usize, count: usize) -> Result<()> {
    let bits = thread.interrupt().load();
    if !bits.any_marking() {
        return Ok(());
    }

    for i in 0..count {
        let slot = dst + i * SLOT_SIZE;
        let target_addr = match heap.read_slot(slot)?.heap_address() {
            Some(addr) => addr,
            None => continue,
        };
        let target = heap.region_of(target_addr).ok_or(ShgcError::InvalidPointer {
            address: target_addr,
        })?;
        let target_kind = space_of(target)?;
        fire_marking_triggers(heap, thread, bits, target, target_kind, target_addr);
    }
    Ok(())
}

/// Copy `count` slots from `src` to `dst`, then run the batched barrier
///
/// Overlapping ranges are copied as by `memmove`.
pub fn copy_slots_with_barrier(
    heap: &Heap,
    thread: &MutatorThread,
    dst: usize,
    src: usize,
    count: usize,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    containing_region(heap, src, count)?;
    containing_region(heap, dst, count)?;

    let copy = |i: usize| -> Result<()> {
        let value = heap.read_slot(src + i * SLOT_SIZE)?;
        heap.write_slot(dst + i * SLOT_SIZE, value)
    };
    if dst > src {
        for i in (0..count).rev() {
            copy(i)?;
        }
    } else {
        for i in 0..count {
            copy(i)?;
        }
    }
    heap.stats().add(Counter::Store, count as u64);

    barrier_batch_bitset(heap, thread, dst, count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShgcConfig;
    use crate::heap::SpaceKind;
    use crate::marker::LocalMarkStatus;
    use crate::runtime::safepoint::SuspendBarrier;
    use crate::stats::SubstrateStats;
    use crate::value::TaggedValue;

    fn setup() -> (Heap, MutatorThread) {
        let config = ShgcConfig::sized(64 * 1024, 16);
        let stats = Arc::new(SubstrateStats::default());
        (
            Heap::new(config, Arc::clone(&stats)).unwrap(),
            MutatorThread::new(1, Arc::new(SuspendBarrier::new()), stats),
        )
    }

    #[test]
    fn test_accumulator_flushes_once_per_word() {
        let (heap, thread) = setup();
        let old = heap.provision_region(SpaceKind::Old, 1).unwrap();
        let young = heap.provision_region(SpaceKind::Young, 1).unwrap().start();

        // 300 consecutive slots with quad_slots = 4 cover 75 quads: words 0 and 1.
        let dst = old.start();
        for i in 0..300 {
            heap.write_slot(dst + i * SLOT_SIZE, TaggedValue::from_object(young))
                .unwrap();
        }
        barrier_batch_bitset(&heap, &thread, dst, 300).unwrap();

        let set = old.remembered_set(RememberedSetKind::OldToNew).unwrap();
        assert_eq!(set.set_bit_count(), 75);
        assert_eq!(heap.stats().snapshot().old_to_new_inserts, 2);
        assert!(old.remembered_set(RememberedSetKind::LocalToShared).is_none());
    }

    #[test]
    fn test_non_references_do_not_create_sets() {
        let (heap, thread) = setup();
        let old = heap.provision_region(SpaceKind::Old, 1).unwrap();
        for i in 0..8 {
            heap.write_slot(old.start() + i * SLOT_SIZE, TaggedValue::from_int(i as i32))
                .unwrap();
        }
        barrier_batch_bitset(&heap, &thread, old.start(), 8).unwrap();
        assert!(old.remembered_set(RememberedSetKind::OldToNew).is_none());
    }

    #[test]
    fn test_range_crossing_region_is_rejected() {
        let (heap, thread) = setup();
        let old = heap.provision_region(SpaceKind::Old, 1).unwrap();
        let near_end = old.end() - 2 * SLOT_SIZE;
        assert!(matches!(
            barrier_batch_bitset(&heap, &thread, near_end, 3),
            Err(ShgcError::BoundsCheckFailed { .. })
        ));
    }

    #[test]
    fn test_handle_mark_greys_each_object_once() {
        let (heap, thread) = setup();
        let old = heap.provision_region(SpaceKind::Old, 1).unwrap();
        let young = heap.provision_region(SpaceKind::Young, 1).unwrap().start();
        for i in 0..4 {
            heap.write_slot(old.start() + i * SLOT_SIZE, TaggedValue::from_object(young))
                .unwrap();
        }

        barrier_batch_bitset(&heap, &thread, old.start(), 4).unwrap();
        assert!(thread.gray().is_empty());

        thread.interrupt().set_local_mark(LocalMarkStatus::Marking);
        barrier_batch_bitset(&heap, &thread, old.start(), 4).unwrap();
        assert_eq!(thread.gray().drain(), vec![young]);
    }

    #[test]
    fn test_copy_slots_overlapping() {
        let (heap, thread) = setup();
        let old = heap.provision_region(SpaceKind::Old, 1).unwrap();
        let base = old.start();
        for i in 0..4 {
            heap.write_slot(base + i * SLOT_SIZE, TaggedValue::from_int(i as i32))
                .unwrap();
        }

        copy_slots_with_barrier(&heap, &thread, base + SLOT_SIZE, base, 4).unwrap();
        let values: Vec<i32> = (0..5)
            .map(|i| heap.read_slot(base + i * SLOT_SIZE).unwrap().as_int().unwrap())
            .collect();
        assert_eq!(values, vec![0, 0, 1, 2, 3]);
    }

    #[test]
    fn test_copy_slots_records_references() {
        let (heap, thread) = setup();
        let young = heap.provision_region(SpaceKind::Young, 1).unwrap();
        let shared = heap.allocate_shared(SpaceKind::SharedOld, 64).unwrap().unwrap();
        heap.write_slot(young.start(), TaggedValue::from_object(shared))
            .unwrap();

        let dst = young.start() + 1024;
        copy_slots_with_barrier(&heap, &thread, dst, young.start(), 1).unwrap();
        let set = young
            .remembered_set(RememberedSetKind::LocalToShared)
            .unwrap();
        assert!(set.contains_slot(dst));
        assert!(!set.contains_slot(young.start()));
    }
}
