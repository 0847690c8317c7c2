//! Safepoint Protocol - Coordinator Side of Thread Suspension
//!
//! A coordinator (collector, debugger, or another mutator) suspends threads
//! in two steps and must never skip the second:
//!
//! 1. **Request**: set `SuspendRequested` in the target's state word.
//!    Frozen targets (Created, Native, Wait) are parked on the spot.
//! 2. **Confirm**: block until the target's state word reads `Suspended`.
//!    A Running target gets there at its next poll.
//!
//! Only after confirmation may the coordinator inspect the target's stack
//! and heap. `Resume` undoes one request; the last one restores the
//! state the thread had before parking.
//!
//! ## VM-wide Suspension
//!
//! ```text
//! request_suspend_all(requester)
//!     │  every thread except the requester: request + VM flag
//!     │  Running ones also get ActiveBarrier and count on the barrier
//!     ▼
//! wait_all_suspended()  ── parks on the barrier until the count is zero
//!     │
//!     ▼
//! resume_all()          ── resumes exactly the threads requested above
//! ```
//!
//! Terminated threads count as parked. Threads registering while the
//! suspension is active are parked before `register` returns.
//!
//! All waits park on condition variables; nothing here spins or times out.

use crate::error::{Result, ShgcError};
use crate::logging::{log_event, SubstrateEvent};
use crate::marker::mark_state::VM_SUSPENSION_BIT;
use crate::thread::{MutatorThread, ThreadRegistry, ThreadState};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Count of threads a VM-wide suspension still waits for
#[derive(Debug, Default)]
pub struct SuspendBarrier {
    pending: Mutex<usize>,
    reached: Condvar,
}

impl SuspendBarrier {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            reached: Condvar::new(),
        }
    }

    pub fn add(&self, n: usize) {
        *self.pending.lock() += n;
    }

    /// One thread reached Suspended (or terminated)
    pub fn arrive(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.reached.notify_all();
        }
    }

    /// Block until every counted thread arrived
    pub fn wait(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.reached.wait(&mut pending);
        }
    }

    pub fn pending(&self) -> usize {
        *self.pending.lock()
    }

    pub(crate) fn reset(&self) {
        *self.pending.lock() = 0;
        self.reached.notify_all();
    }
}

/// Coordinator entry points of the suspension protocol
pub struct SafepointProtocol {
    registry: Arc<ThreadRegistry>,
}

impl SafepointProtocol {
    pub fn new(registry: Arc<ThreadRegistry>) -> Self {
        Self { registry }
    }

    /// Ask `thread` to suspend; requests nest
    ///
    /// # Returns
    /// * `Err(ShgcError::ThreadTerminated)` - the thread is already gone
    pub fn request_suspend(&self, thread: &MutatorThread) -> Result<()> {
        thread.request_suspend(false).map(|_| ())
    }

    /// Block until `thread` is confirmed Suspended
    ///
    /// A registered `waiter` sits in Wait while blocked, so it can itself be
    /// suspended by someone else meanwhile.
    ///
    /// # Returns
    /// * `Err(ShgcError::ThreadTerminated)` - the thread terminated instead
    /// * `Err(ShgcError::ProtocolViolation)` - no request is outstanding, or
    ///   the waiter is the thread itself
    pub fn wait_suspended(
        &self,
        thread: &MutatorThread,
        waiter: Option<&MutatorThread>,
    ) -> Result<()> {
        if waiter.map_or(false, |w| w.id() == thread.id()) {
            crate::protocol_violation!("thread {} waiting for its own suspension", thread.id());
        }
        let _scope = match waiter {
            Some(w) if w.state() == ThreadState::Running => Some(w.wait_scope()?),
            _ => None,
        };
        thread.wait_suspended()
    }

    /// Drop one request on `thread`
    pub fn resume(&self, thread: &MutatorThread) -> Result<()> {
        thread.resume(false)
    }

    /// Request suspension of every registered thread except `requester`
    ///
    /// Returns the number of threads requested.
    ///
    /// # Returns
    /// * `Err(ShgcError::ProtocolViolation)` - a VM-wide suspension is
    ///   already active
    pub fn request_suspend_all(&self, requester: Option<&MutatorThread>) -> Result<usize> {
        let mut vm = self.registry.vm_state();
        if vm.active {
            crate::protocol_violation!("VM-wide suspension requested while one is active");
        }

        let requester_id = requester.map(|t| t.id());
        self.registry.vm_barrier().reset();
        vm.active = true;
        vm.requester = requester_id;
        vm.requested.clear();

        let mut pending = 0;
        for thread in self.registry.snapshot() {
            if Some(thread.id()) == requester_id {
                continue;
            }
            match thread.request_suspend(true) {
                Ok(must_poll) => {
                    if must_poll {
                        pending += 1;
                    }
                    thread.interrupt().set_flag(VM_SUSPENSION_BIT);
                    vm.requested.push(thread);
                },
                // Terminated threads count as parked.
                Err(ShgcError::ThreadTerminated { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        log::info!(
            "VM suspension: {} threads requested, {} still running",
            vm.requested.len(),
            pending
        );
        log_event(SubstrateEvent::SuspendAllRequested {
            requester: requester_id,
            pending,
        });
        Ok(vm.requested.len())
    }

    /// Block until every thread of the VM-wide suspension is parked
    ///
    /// # Returns
    /// * `Err(ShgcError::ProtocolViolation)` - no VM-wide suspension is active
    pub fn wait_all_suspended(&self, waiter: Option<&MutatorThread>) -> Result<()> {
        let threads = {
            let vm = self.registry.vm_state();
            if !vm.active {
                crate::protocol_violation!("waiting for a VM-wide suspension that is not active");
            }
            vm.requested.len()
        };

        let _scope = match waiter {
            Some(w) if w.state() == ThreadState::Running => Some(w.wait_scope()?),
            _ => None,
        };
        self.registry.vm_barrier().wait();

        log::info!("VM suspension reached: {} threads parked", threads);
        log_event(SubstrateEvent::SuspendAllReached { threads });
        Ok(())
    }

    /// Resume exactly the threads the VM-wide suspension requested
    ///
    /// Returns the number of threads resumed.
    pub fn resume_all(&self) -> Result<usize> {
        let mut vm = self.registry.vm_state();
        if !vm.active {
            crate::protocol_violation!("resume_all without an active VM-wide suspension");
        }

        // Every requested thread gets its resume even if an earlier one fails.
        let requested = std::mem::take(&mut vm.requested);
        let mut first_error = None;
        for thread in &requested {
            thread.interrupt().clear_flag(VM_SUSPENSION_BIT);
            if let Err(e) = thread.resume(true) {
                log::warn!("VM resume of thread {} failed: {}", thread.id(), e);
                first_error.get_or_insert(e);
            }
        }
        vm.active = false;
        vm.requester = None;
        self.registry.vm_barrier().reset();

        log::info!("VM suspension lifted: {} threads resumed", requested.len());
        log_event(SubstrateEvent::ResumeAll {
            threads: requested.len(),
        });
        match first_error {
            Some(e) => Err(e),
            None => Ok(requested.len()),
        }
    }

    pub fn is_vm_suspension_active(&self) -> bool {
        self.registry.vm_state().active
    }

    /// Threads the VM barrier is still waiting for
    pub fn pending_threads(&self) -> usize {
        self.registry.vm_barrier().pending()
    }
}
