//! Error Module - SHGC Error Types
//!
//! Defines all error types surfaced by the substrate.
//!
//! # Error Categories
//!
//! ## Memory Errors
//! - `OutOfMemory` - runtime allocator (or remembered-set creation) could not
//!   satisfy a request, even after the collector hook had its chance
//! - `InvalidPointer` - a heap reference that does not resolve to a live region
//! - `AlignmentError` - slot access that is not slot aligned
//!
//! ## Protocol Errors
//! - `InvalidTransition` - a mutator left the thread state machine
//! - `ProtocolViolation` - a coordinator misused the suspension protocol
//! - `ThreadTerminated` - operation on a thread that already terminated
//!
//! ## Job Errors
//! - `JobFailed` - a drained job raised; the rest of the queue is untouched
//!
//! ## Configuration Errors
//! - `Configuration` - invalid [`ShgcConfig`](crate::config::ShgcConfig)

use crate::config::ConfigError;
use crate::thread::ThreadState;
use thiserror::Error;

/// Main error type for all SHGC operations
///
/// # Examples
///
/// ```rust
/// use shgc::error::ShgcError;
///
/// fn handle_error(err: ShgcError) {
///     match err {
///         ShgcError::OutOfMemory { requested, available } => {
///             eprintln!("OOM: requested {}, available {}", requested, available);
///         }
///         ShgcError::ThreadTerminated { thread } => {
///             eprintln!("thread {} is gone", thread);
///         }
///         _ => eprintln!("Other error: {}", err),
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum ShgcError {
    /// Out of memory
    ///
    /// **When returned:** the runtime allocator found no region space for the
    /// request after the collector hook ran once, or a remembered set could
    /// not be reserved.
    ///
    /// **Recovery strategy:** none inside the substrate; the mutator raises
    /// its out-of-memory condition.
    #[error("Out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    /// Heap initialization failed
    ///
    /// **When returned:** the address-space reservation could not be mapped.
    #[error("Heap initialization failed: {0}")]
    HeapInitialization(String),

    /// Address does not belong to an in-use region
    #[error("Invalid pointer address: {address:#x}")]
    InvalidPointer { address: usize },

    /// Region provisioning failed for a reason other than exhaustion
    #[error("Region allocation failed: {reason}")]
    RegionAllocationFailed { reason: String },

    /// A mutator attempted a transition outside the thread state machine
    ///
    /// **Recovery strategy:** cannot recover - this is a bug in the caller.
    #[error("Invalid thread state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: ThreadState, to: ThreadState },

    /// The suspension protocol was used out of order
    ///
    /// **Example scenarios:**
    /// - `resume` without a matching `request_suspend`
    /// - `wait_suspended` with no request outstanding
    /// - nested `request_suspend_all`
    #[error("Suspend protocol violation: {0}")]
    ProtocolViolation(String),

    /// The thread reached its final state
    #[error("Thread {thread} is terminated")]
    ThreadTerminated { thread: u32 },

    /// The thread id is not registered
    #[error("Thread {thread} is not registered")]
    UnknownThread { thread: u32 },

    /// A drained job raised
    ///
    /// **Recovery strategy:** the queue keeps its remaining entries, draining
    /// again resumes with the next job.
    #[error("Job #{order} failed: {message}")]
    JobFailed { order: u64, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Alignment error
    #[error("Alignment error: address {address:#x} is not aligned to {alignment} bytes")]
    AlignmentError { address: usize, alignment: usize },

    /// Bounds check failed
    #[error("Bounds check failed: index {index} out of bounds for length {length}")]
    BoundsCheckFailed { index: usize, length: usize },

    /// Internal error - indicates a bug in SHGC
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShgcError {
    /// Check if this error is recoverable by the caller
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ShgcError::JobFailed { .. })
    }

    /// Check if this error indicates a bug in the calling code or in SHGC
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            ShgcError::InvalidTransition { .. }
                | ShgcError::ProtocolViolation(_)
                | ShgcError::BoundsCheckFailed { .. }
                | ShgcError::AlignmentError { .. }
                | ShgcError::Internal(_)
        )
    }

    /// Check if this error is the fatal allocation-failure condition
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, ShgcError::OutOfMemory { .. })
    }
}

/// Result type alias for SHGC operations
pub type Result<T> = std::result::Result<T, ShgcError>;

/// Report a protocol violation: asserts in debug builds, returns the error
/// in release builds.
#[macro_export]
macro_rules! protocol_violation {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        log::error!("suspend protocol violation: {}", message);
        debug_assert!(false, "suspend protocol violation: {}", message);
        return Err($crate::error::ShgcError::ProtocolViolation(message));
    }};
}
