//! Remembered Set - Per-Region Quad Bitmap
//!
//! A remembered set records which quads of a region may hold a reference
//! the local collector has to rescan. One bit per quad, 64 quads per word:
//!
//! ```text
//! region start                                             region end
//! │ q0 │ q1 │ q2 │ ... │ q63 │ q64 │ ...                            │
//!   └──────── word 0 ────────┘ └── word 1 ...
//! quad = (slot_addr - region_start) / SLOT_SIZE >> quad_shift
//! ```
//!
//! # Memory Ordering
//!
//! Mutators only ever OR bits in (`fetch_or`, Relaxed). The bitmap is not
//! collector-visible heap memory, so it needs no barrier of its own. The
//! collector reads it after a synchronization point (a safepoint or its
//! own consume point); clearing is a collector-only operation.

use crate::error::{Result, ShgcError};
use crate::heap::SLOT_SIZE;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which pointer set a remembered set tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RememberedSetKind {
    /// Local region slots pointing into the shared sweepable space
    LocalToShared,
    /// Old region slots pointing into the young generation
    OldToNew,
}

/// Quad bitmap for one region
pub struct RememberedSet {
    /// Start of the owning region
    region_start: usize,

    /// log2(slots per quad)
    quad_shift: u32,

    /// Number of quads covered
    quad_count: usize,

    /// Bit words, zero-filled on creation
    words: Box<[AtomicU64]>,
}

impl RememberedSet {
    /// Create a zero-filled set covering `region_bytes` from `region_start`
    ///
    /// # Returns
    /// * `Err(ShgcError::OutOfMemory)` - the bitmap could not be reserved
    pub fn new(region_start: usize, region_bytes: usize, quad_shift: u32) -> Result<Self> {
        let slots = region_bytes / SLOT_SIZE;
        let quad_count = (slots + (1usize << quad_shift) - 1) >> quad_shift;
        let word_count = (quad_count + 63) / 64;

        let mut words: Vec<AtomicU64> = Vec::new();
        words
            .try_reserve_exact(word_count)
            .map_err(|_| ShgcError::OutOfMemory {
                requested: word_count * std::mem::size_of::<AtomicU64>(),
                available: 0,
            })?;
        words.extend((0..word_count).map(|_| AtomicU64::new(0)));

        Ok(Self {
            region_start,
            quad_shift,
            quad_count,
            words: words.into_boxed_slice(),
        })
    }

    /// Back-pointer to the owning region
    pub fn region_start(&self) -> usize {
        self.region_start
    }

    pub fn quad_count(&self) -> usize {
        self.quad_count
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Word index and single-bit mask of `slot_addr` in a region starting
    /// at `region_start`, without needing the set itself
    #[inline]
    pub fn quad_position(region_start: usize, quad_shift: u32, slot_addr: usize) -> (usize, u64) {
        debug_assert!(slot_addr >= region_start);
        let quad = ((slot_addr - region_start) / SLOT_SIZE) >> quad_shift;
        (quad / 64, 1u64 << (quad % 64))
    }

    /// Quad index of a slot address inside the region
    #[inline]
    pub fn quad_index(&self, slot_addr: usize) -> usize {
        debug_assert!(slot_addr >= self.region_start);
        ((slot_addr - self.region_start) / SLOT_SIZE) >> self.quad_shift
    }

    /// Word index and single-bit mask of a slot address
    #[inline]
    pub fn word_and_mask(&self, slot_addr: usize) -> (usize, u64) {
        Self::quad_position(self.region_start, self.quad_shift, slot_addr)
    }

    /// OR `mask` into bit word `word_index`
    ///
    /// Never clears a bit. An index outside the region is a caller bug and
    /// panics.
    #[inline]
    pub fn set_quad(&self, word_index: usize, mask: u64) {
        if mask != 0 {
            self.words[word_index].fetch_or(mask, Ordering::Relaxed);
        }
    }

    /// Record the quad containing `slot_addr`
    #[inline]
    pub fn insert(&self, slot_addr: usize) {
        let (word, mask) = self.word_and_mask(slot_addr);
        self.set_quad(word, mask);
    }

    pub fn is_quad_set(&self, quad: usize) -> bool {
        match self.words.get(quad / 64) {
            Some(word) => word.load(Ordering::Relaxed) & (1u64 << (quad % 64)) != 0,
            None => false,
        }
    }

    /// Whether the quad holding `slot_addr` is recorded
    pub fn contains_slot(&self, slot_addr: usize) -> bool {
        slot_addr >= self.region_start && self.is_quad_set(self.quad_index(slot_addr))
    }

    pub fn set_bit_count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Relaxed) == 0)
    }

    /// Visit every set quad in ascending order
    pub fn for_each_quad<F: FnMut(usize)>(&self, mut visit: F) {
        for (index, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Relaxed);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                visit(index * 64 + bit);
                bits &= bits - 1;
            }
        }
    }

    /// Visit the address of every slot covered by a set quad
    pub fn for_each_slot<F: FnMut(usize)>(&self, mut visit: F) {
        let slots_per_quad = 1usize << self.quad_shift;
        self.for_each_quad(|quad| {
            let first = self.region_start + ((quad << self.quad_shift) * SLOT_SIZE);
            for i in 0..slots_per_quad {
                visit(first + i * SLOT_SIZE);
            }
        });
    }

    /// Copy of the bit words, for the collector's consume point
    pub fn snapshot_words(&self) -> Vec<u64> {
        self.words.iter().map(|w| w.load(Ordering::Relaxed)).collect()
    }

    /// Clear every bit
    ///
    /// Collector only: called while sweeping remembered sets, never from a
    /// mutator.
    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for RememberedSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RememberedSet")
            .field("region_start", &format_args!("{:#x}", self.region_start))
            .field("quad_count", &self.quad_count)
            .field("set_bits", &self.set_bit_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: usize = 0x10_0000;

    #[test]
    fn test_new_set_is_zeroed() {
        let set = RememberedSet::new(START, 4096, 2).unwrap();
        assert_eq!(set.quad_count(), 4096 / 8 / 4);
        assert_eq!(set.word_count(), 2);
        assert!(set.is_empty());
    }

    #[test]
    fn test_insert_sets_quad_bit() {
        let set = RememberedSet::new(START, 4096, 2).unwrap();
        set.insert(START + 3 * SLOT_SIZE);
        assert!(set.is_quad_set(0));
        assert!(set.contains_slot(START));
        assert!(!set.contains_slot(START + 4 * SLOT_SIZE));

        set.insert(START + 7 * SLOT_SIZE);
        assert!(set.is_quad_set(1));
        assert!(set.is_quad_set(0), "earlier bit must survive");
        assert_eq!(set.set_bit_count(), 2);
    }

    #[test]
    fn test_set_quad_is_or_only() {
        let set = RememberedSet::new(START, 4096, 0).unwrap();
        set.set_quad(1, 0b1010);
        set.set_quad(1, 0b0101);
        set.set_quad(1, 0);
        assert_eq!(set.snapshot_words()[1], 0b1111);
    }

    #[test]
    fn test_for_each_slot_covers_whole_quad() {
        let set = RememberedSet::new(START, 4096, 2).unwrap();
        set.insert(START + 9 * SLOT_SIZE);

        let mut slots = Vec::new();
        set.for_each_slot(|addr| slots.push((addr - START) / SLOT_SIZE));
        assert_eq!(slots, vec![8, 9, 10, 11]);
    }

    #[test]
    fn test_clear_all() {
        let set = RememberedSet::new(START, 4096, 1).unwrap();
        set.insert(START);
        set.insert(START + 1000 * SLOT_SIZE / 2);
        assert!(!set.is_empty());
        set.clear_all();
        assert!(set.is_empty());
    }

    #[test]
    fn test_concurrent_inserts_never_lose_bits() {
        use std::sync::Arc;
        use std::thread;

        let set = Arc::new(RememberedSet::new(START, 64 * 1024, 0).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let set = Arc::clone(&set);
                thread::spawn(move || {
                    for slot in (t..8192).step_by(4) {
                        set.insert(START + slot * SLOT_SIZE);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(set.set_bit_count(), 8192);
    }
}
