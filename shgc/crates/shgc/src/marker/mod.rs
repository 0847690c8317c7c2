//! Marker Module - Concurrent Mark Coordination
//!
//! Tracing itself lives in the collector. This module holds what the
//! mutator side needs to cooperate with a running mark:
//!
//! - [`mark_state`]: the per-thread interrupt word and its two mark fields
//! - [`marking_barrier`]: gray sets and the local/shared marking triggers

pub mod mark_state;
pub mod marking_barrier;

pub use mark_state::{InterruptBits, InterruptWord, LocalMarkStatus, SharedMarkStatus};
pub use marking_barrier::{marking_barrier, shared_marking_barrier, GrayQueue};
