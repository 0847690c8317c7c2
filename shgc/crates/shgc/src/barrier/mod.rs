//! Barrier Module - Generational and Cross-Heap Write Barriers
//!
//! Stores into the heap have to tell two collectors about new edges:
//!
//! - the local collector, through per-region remembered sets
//!   (`OldToNew` for old-to-young, `LocalToShared` for local-to-shared)
//! - a running concurrent marker, through the gray sets
//!
//! Sub-modules:
//! - [`remembered_set`]: the quad bitmap itself
//! - [`write_barrier`]: single-slot store with a compile-time policy
//! - [`batch`]: bulk variant with word accumulators and a marking pass

pub mod batch;
pub mod remembered_set;
pub mod write_barrier;

pub use batch::{barrier_batch_bitset, copy_slots_with_barrier, handle_mark};
pub use remembered_set::{RememberedSet, RememberedSetKind};
pub use write_barrier::{set_value_with_barrier, store, BarrierPolicy, ValueKind};
