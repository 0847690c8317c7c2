//! # SHGC - Shared-Heap GC Concurrency Substrate
//!
//! SHGC is the mutator-side half of a garbage collector for a VM whose
//! threads each own a local heap and together share one shared heap. It
//! does not collect anything itself; it keeps the data structures and
//! protocols the collectors rely on correct while mutators run.
//!
//! ## Overview
//!
//! - **Remembered Sets**: per-region quad bitmaps of slots that hold
//!   old-to-young or local-to-shared references
//! - **Write Barriers**: single-slot and batched, maintaining the
//!   remembered sets and feeding concurrent marking
//! - **Mark State**: a per-thread interrupt word carrying local and shared
//!   mark status plus suspension and termination flags
//! - **Allocation Fast Path**: inline young bump allocation with a runtime
//!   allocator call behind it
//! - **Safepoints**: a thread state machine with nested suspend requests
//!   and VM-wide suspension
//! - **Microtasks**: per-thread promise and script job queues
//!
//! ## Quick Start
//!
//! ```rust
//! use shgc::{BarrierPolicy, Generation, RememberedSetKind, Runtime, ShgcConfig, TaggedValue};
//!
//! fn main() -> Result<(), shgc::ShgcError> {
//!     let runtime = Runtime::new(ShgcConfig::default())?;
//!     let thread = runtime.create_thread()?;
//!     thread.start()?;
//!
//!     let old = runtime.allocate(&thread, Generation::Old, 64)?;
//!     let young = runtime.allocate(&thread, Generation::Young, 32)?;
//!
//!     // old.field[2] = young
//!     runtime.store(&thread, old, 16, TaggedValue::from_object(young), BarrierPolicy::NeedBarrier)?;
//!
//!     let region = runtime.heap().region_of(old).expect("live region");
//!     let set = region.remembered_set(RememberedSetKind::OldToNew).expect("set created");
//!     assert!(set.contains_slot(old + 16));
//!
//!     runtime.shutdown()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     Mutator Threads                        │
//! │   state word ─ interrupt word ─ young/old cursors ─ jobs   │
//! │        │               │                 │                 │
//! │   safepoint poll   write barrier    allocation fast path   │
//! └────────┼───────────────┼─────────────────┼─────────────────┘
//!          │               │                 │
//! ┌────────┼───────────────┼─────────────────┼─────────────────┐
//! │        ▼               ▼                 ▼      Heap       │
//! │  SafepointProtocol   RememberedSets    Regions             │
//! │  ThreadRegistry      GrayQueues        (one reservation)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Thread Safety
//!
//! - `Runtime` is `Send + Sync`; one instance serves every mutator
//! - Each `MutatorThread` handle must only drive mutator-side transitions
//!   from the OS thread it represents
//! - Coordinator operations (suspend, resume, mark status) may come from
//!   any thread
//!
//! ## Modules
//!
//! - [`allocator`]: inline young allocation and the runtime allocator
//! - [`barrier`]: remembered sets and write barriers
//! - [`config`]: substrate configuration and validation
//! - [`error`]: error types for all operations
//! - [`heap`]: region reservation, descriptors and slot access
//! - [`jobs`]: per-thread microtask queues
//! - [`logging`]: structured substrate events
//! - [`marker`]: interrupt word, mark status and gray queues
//! - [`runtime`]: facade and safepoint protocol
//! - [`stats`]: substrate counters
//! - [`thread`]: thread state machine and registry
//! - [`value`]: tagged slot values

// Configuration and errors
pub mod config;
pub mod error;

// Heap and values
pub mod heap;
pub mod value;

// Mutator-side GC components
pub mod allocator;
pub mod barrier;
pub mod marker;

// Threads and scheduling
pub mod jobs;
pub mod thread;

// Runtime and monitoring
pub mod logging;
pub mod runtime;
pub mod stats;

pub use allocator::CollectorHooks;
pub use barrier::{BarrierPolicy, RememberedSet, RememberedSetKind, ValueKind};
pub use config::ShgcConfig;
pub use error::{Result, ShgcError};
pub use heap::{Generation, Heap, Region, SpaceKind};
pub use jobs::{JobError, QueueKind};
pub use marker::{LocalMarkStatus, SharedMarkStatus};
pub use runtime::{Runtime, RuntimeState};
pub use thread::{MutatorThread, ThreadState};
pub use value::TaggedValue;

/// SHGC version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create a runtime with configuration from the environment
///
/// See [`ShgcConfig::from_env`] for the recognised variables.
///
/// # Examples
///
/// ```rust
/// let runtime = shgc::init()?;
/// runtime.shutdown()?;
/// # Ok::<(), shgc::ShgcError>(())
/// ```
pub fn init() -> Result<Runtime> {
    Runtime::new(ShgcConfig::from_env())
}
