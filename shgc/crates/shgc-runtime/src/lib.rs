//! SHGC Runtime Library
//!
//! C entry points for embedding the substrate:
//! - process-wide initialization and shutdown
//! - mutator thread attach/detach, bound to the calling OS thread
//! - barriered stores, allocation and safepoint polls
//! - VM-wide suspension and microtask draining

mod ffi;

pub use ffi::*;
