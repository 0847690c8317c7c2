//! Thread Module - Mutator State Machine
//!
//! - [`state`]: the packed state word (state + protocol flags)
//! - [`mutator`]: the per-thread context and its transitions
//! - [`registry`]: registration, lookup and shared mark broadcast

pub mod mutator;
pub mod registry;
pub mod state;

pub use mutator::{MutatorThread, NativeScope, WaitScope};
pub use registry::ThreadRegistry;
pub use state::{StateBits, ThreadState, ACTIVE_BARRIER, SUSPEND_REQUESTED};
