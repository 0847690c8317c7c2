//! Mutator Thread - Per-Thread Context
//!
//! One `MutatorThread` per registered OS thread. It bundles what the
//! barriers, the allocator and the suspension protocol need to find from a
//! thread pointer:
//!
//! - the packed state word and the interrupt word
//! - the suspension bookkeeping (request depth, prior state, VM barrier)
//! - the current young and old allocation regions
//! - the local gray set and the micro job queue
//!
//! # Locking
//!
//! Every transition into or out of `Suspended`, and `Terminated`, happens
//! with `suspension` held and is followed by a `changed` notification, so
//! a waiter checking the state word under the same lock never misses a
//! wake-up. Unflagged mutator transitions skip the lock entirely (one CAS
//! on the state word).

use crate::error::{Result, ShgcError};
use crate::heap::NO_REGION;
use crate::jobs::MicroJobQueue;
use crate::logging::{log_event, SubstrateEvent};
use crate::marker::mark_state::TERMINATION_BIT;
use crate::marker::{GrayQueue, InterruptWord};
use crate::runtime::safepoint::SuspendBarrier;
use crate::stats::{Counter, SubstrateStats};
use crate::thread::state::{StateBits, StateWord, ThreadState, ACTIVE_BARRIER, SUSPEND_REQUESTED};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Report an out-of-machine transition: asserts in debug builds, returns
/// `InvalidTransition` in release builds.
macro_rules! invalid_transition {
    ($thread:expr, $from:expr, $to:expr) => {{
        let (from, to) = ($from, $to);
        log::error!("thread {}: invalid transition {:?} -> {:?}", $thread, from, to);
        debug_assert!(false, "invalid thread state transition: {:?} -> {:?}", from, to);
        return Err(ShgcError::InvalidTransition { from, to });
    }};
}

#[derive(Debug)]
struct SuspendInfo {
    /// Outstanding suspend requests, VM-wide one included
    count: u32,

    /// State to restore on the last resume
    prior: ThreadState,

    /// One of the outstanding requests is the VM-wide suspension
    vm_requested: bool,

    /// The VM barrier still counts this thread
    vm_pending: bool,
}

/// Per-thread mutator context
pub struct MutatorThread {
    id: u32,
    state: StateWord,
    interrupt: InterruptWord,

    suspension: Mutex<SuspendInfo>,
    changed: Condvar,
    vm_barrier: Arc<SuspendBarrier>,

    young_region: AtomicUsize,
    old_region: AtomicUsize,

    jobs: MicroJobQueue,
    gray: GrayQueue,

    safepoint_polls: AtomicU64,
    safepoint_parks: AtomicU64,
    stats: Arc<SubstrateStats>,
}

impl MutatorThread {
    pub(crate) fn new(id: u32, vm_barrier: Arc<SuspendBarrier>, stats: Arc<SubstrateStats>) -> Self {
        Self {
            id,
            state: StateWord::new(ThreadState::Created),
            interrupt: InterruptWord::new(),
            suspension: Mutex::new(SuspendInfo {
                count: 0,
                prior: ThreadState::Created,
                vm_requested: false,
                vm_pending: false,
            }),
            changed: Condvar::new(),
            vm_barrier,
            young_region: AtomicUsize::new(NO_REGION),
            old_region: AtomicUsize::new(NO_REGION),
            jobs: MicroJobQueue::new(),
            gray: GrayQueue::new(),
            safepoint_polls: AtomicU64::new(0),
            safepoint_parks: AtomicU64::new(0),
            stats,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state.state()
    }

    #[inline]
    pub fn state_bits(&self) -> StateBits {
        self.state.load()
    }

    #[inline]
    pub fn interrupt(&self) -> &InterruptWord {
        &self.interrupt
    }

    pub fn jobs(&self) -> &MicroJobQueue {
        &self.jobs
    }

    /// Gray set of this thread's local heap marker
    pub fn gray(&self) -> &GrayQueue {
        &self.gray
    }

    /// Outstanding suspend requests
    pub fn suspend_count(&self) -> u32 {
        self.suspension.lock().count
    }

    pub fn safepoint_polls(&self) -> u64 {
        self.safepoint_polls.load(Ordering::Relaxed)
    }

    /// Times this thread parked itself at a poll
    pub fn safepoint_parks(&self) -> u64 {
        self.safepoint_parks.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn young_region(&self) -> usize {
        self.young_region.load(Ordering::Relaxed)
    }

    pub(crate) fn set_young_region(&self, index: usize) {
        self.young_region.store(index, Ordering::Relaxed);
    }

    pub(crate) fn old_region(&self) -> usize {
        self.old_region.load(Ordering::Relaxed)
    }

    pub(crate) fn set_old_region(&self, index: usize) {
        self.old_region.store(index, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Mutator-side transitions
    // ------------------------------------------------------------------

    /// `Created -> Running`
    ///
    /// Blocks while a coordinator holds the thread suspended.
    pub fn start(&self) -> Result<()> {
        self.enter_running(ThreadState::Created)
    }

    /// `Running -> Native`, an implicit safepoint announcement
    pub fn enter_native(&self) -> Result<()> {
        self.leave_running(ThreadState::Native)
    }

    /// `Native -> Running`, blocking while suspended
    pub fn leave_native(&self) -> Result<()> {
        self.enter_running(ThreadState::Native)
    }

    /// `Running -> Wait`, before blocking inside a protocol wait
    pub fn enter_wait(&self) -> Result<()> {
        self.leave_running(ThreadState::Wait)
    }

    pub fn leave_wait(&self) -> Result<()> {
        self.enter_running(ThreadState::Wait)
    }

    /// Enter Native for the lifetime of the returned guard
    pub fn native_scope(&self) -> Result<NativeScope<'_>> {
        self.enter_native()?;
        Ok(NativeScope { thread: self })
    }

    /// Enter Wait for the lifetime of the returned guard
    pub fn wait_scope(&self) -> Result<WaitScope<'_>> {
        self.enter_wait()?;
        Ok(WaitScope { thread: self })
    }

    fn enter_running(&self, from: ThreadState) -> Result<()> {
        if self.state.try_fast_transition(from, ThreadState::Running) {
            return Ok(());
        }

        let mut info = self.suspension.lock();
        loop {
            let bits = self.state.load();
            match bits.state() {
                ThreadState::Suspended => self.changed.wait(&mut info),
                ThreadState::Terminated => {
                    return Err(ShgcError::ThreadTerminated { thread: self.id })
                },
                state if state == from => {
                    if bits.suspend_requested() {
                        self.park_locked(&mut info, true);
                        continue;
                    }
                    if self
                        .state
                        .compare_exchange(bits, bits.with_state(ThreadState::Running))
                        .is_ok()
                    {
                        return Ok(());
                    }
                },
                state => invalid_transition!(self.id, state, ThreadState::Running),
            }
        }
    }

    fn leave_running(&self, to: ThreadState) -> Result<()> {
        if self.state.try_fast_transition(ThreadState::Running, to) {
            return Ok(());
        }

        let mut info = self.suspension.lock();
        loop {
            let bits = self.state.load();
            match bits.state() {
                ThreadState::Running => {
                    if self.state.compare_exchange(bits, bits.with_state(to)).is_err() {
                        continue;
                    }
                    // A pending request would otherwise wait for a poll that
                    // never comes while we are frozen.
                    if bits.suspend_requested() {
                        self.park_locked(&mut info, true);
                    }
                    return Ok(());
                },
                ThreadState::Terminated => {
                    return Err(ShgcError::ThreadTerminated { thread: self.id })
                },
                state => invalid_transition!(self.id, state, to),
            }
        }
    }

    /// Cooperative safepoint poll
    ///
    /// One acquire load when nothing is requested. Otherwise the thread
    /// parks in `Suspended` until the last outstanding request is resumed.
    ///
    /// # Returns
    /// * `Err(ShgcError::ThreadTerminated)` - the thread was terminated,
    ///   possibly while parked
    #[inline]
    pub fn poll_safepoint(&self) -> Result<()> {
        self.safepoint_polls.fetch_add(1, Ordering::Relaxed);
        self.stats.bump(Counter::SafepointPoll);

        let bits = self.state.load();
        if bits.state() == ThreadState::Terminated {
            return Err(ShgcError::ThreadTerminated { thread: self.id });
        }
        if !bits.suspend_requested() {
            return Ok(());
        }
        self.park_at_poll()
    }

    #[cold]
    fn park_at_poll(&self) -> Result<()> {
        let mut info = self.suspension.lock();
        let bits = self.state.load();
        match bits.state() {
            ThreadState::Running if bits.suspend_requested() => {
                self.park_locked(&mut info, false);
                self.safepoint_parks.fetch_add(1, Ordering::Relaxed);
                self.stats.bump(Counter::SafepointPark);
                self.wait_while_suspended(&mut info);
            },
            ThreadState::Running | ThreadState::Terminated => {},
            state => invalid_transition!(self.id, state, ThreadState::Suspended),
        }

        if self.state.state() == ThreadState::Terminated {
            return Err(ShgcError::ThreadTerminated { thread: self.id });
        }
        Ok(())
    }

    fn wait_while_suspended(&self, info: &mut MutexGuard<'_, SuspendInfo>) {
        while self.state.state() == ThreadState::Suspended {
            self.changed.wait(info);
        }
    }

    /// Move a Running or frozen thread to Suspended
    ///
    /// Caller holds `suspension`. Returns `false` when the state no longer
    /// allows parking.
    fn park_locked(&self, info: &mut SuspendInfo, on_behalf: bool) -> bool {
        loop {
            let bits = self.state.load();
            let prior = bits.state();
            let allowed = if on_behalf {
                prior.is_parkable_on_behalf()
            } else {
                prior == ThreadState::Running
            };
            if !allowed {
                return false;
            }

            let parked = StateBits::pack(ThreadState::Suspended, bits.flags() & !ACTIVE_BARRIER);
            if self.state.compare_exchange(bits, parked).is_err() {
                continue;
            }

            info.prior = prior;
            if info.vm_pending {
                info.vm_pending = false;
                self.vm_barrier.arrive();
            }
            self.changed.notify_all();

            log::debug!("thread {} parked from {:?}", self.id, prior);
            log_event(SubstrateEvent::ThreadParked {
                thread: self.id,
                on_behalf,
            });
            return true;
        }
    }

    // ------------------------------------------------------------------
    // Coordinator-side protocol
    // ------------------------------------------------------------------

    /// Register one more suspend request
    ///
    /// Frozen threads (Created, Native, Wait) are parked right here on the
    /// thread's behalf. With `vm` set, a Running thread is also counted on
    /// the VM barrier until it reaches a poll.
    ///
    /// # Returns
    /// `true` when the thread is still Running and has to reach a poll.
    pub(crate) fn request_suspend(&self, vm: bool) -> Result<bool> {
        let mut info = self.suspension.lock();
        if self.state.state() == ThreadState::Terminated {
            return Err(ShgcError::ThreadTerminated { thread: self.id });
        }
        if vm && info.vm_requested {
            crate::protocol_violation!("thread {} already requested by a VM-wide suspension", self.id);
        }

        info.count += 1;
        if vm {
            info.vm_requested = true;
        }
        self.state.set_flags(SUSPEND_REQUESTED);

        log::debug!("thread {} suspend requested (depth {})", self.id, info.count);
        log_event(SubstrateEvent::SuspendRequested {
            thread: self.id,
            count: info.count,
        });

        if self.park_locked(&mut info, true) {
            return Ok(false);
        }

        match self.state.state() {
            ThreadState::Running => {
                if vm {
                    info.vm_pending = true;
                    self.vm_barrier.add(1);
                    self.state.set_flags(ACTIVE_BARRIER);
                }
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    /// Block until the thread reads Suspended
    ///
    /// # Returns
    /// * `Err(ShgcError::ThreadTerminated)` - the thread terminated before
    ///   (or instead of) parking
    /// * `Err(ShgcError::ProtocolViolation)` - no request is outstanding
    pub(crate) fn wait_suspended(&self) -> Result<()> {
        let mut info = self.suspension.lock();
        loop {
            match self.state.state() {
                ThreadState::Suspended => return Ok(()),
                ThreadState::Terminated => {
                    return Err(ShgcError::ThreadTerminated { thread: self.id })
                },
                _ if info.count == 0 => {
                    crate::protocol_violation!(
                        "waiting for thread {} without an outstanding suspend request",
                        self.id
                    );
                },
                _ => self.changed.wait(&mut info),
            }
        }
    }

    /// Drop one suspend request; the last one restores the prior state
    ///
    /// Resuming a terminated thread is a no-op.
    pub(crate) fn resume(&self, vm: bool) -> Result<()> {
        let mut info = self.suspension.lock();
        if self.state.state() == ThreadState::Terminated {
            return Ok(());
        }
        if info.count == 0 {
            crate::protocol_violation!("resume of thread {} without a suspend request", self.id);
        }
        if vm {
            if !info.vm_requested {
                crate::protocol_violation!("thread {} was not part of the VM-wide suspension", self.id);
            }
            info.vm_requested = false;
            info.vm_pending = false;
            self.state.clear_flags(ACTIVE_BARRIER);
        } else if info.count - u32::from(info.vm_requested) == 0 {
            // The only hold left belongs to the VM-wide suspension.
            crate::protocol_violation!(
                "resume of thread {} without a per-thread suspend request",
                self.id
            );
        }

        info.count -= 1;
        if info.count > 0 {
            return Ok(());
        }

        // Clear the flags and restore the prior state in one CAS.
        let restored = loop {
            let bits = self.state.load();
            let target = match bits.state() {
                ThreadState::Suspended => info.prior,
                state => state,
            };
            if self
                .state
                .compare_exchange(bits, StateBits::pack(target, 0))
                .is_ok()
            {
                break target;
            }
        };
        self.changed.notify_all();
        drop(info);

        log::debug!("thread {} resumed to {:?}", self.id, restored);
        log_event(SubstrateEvent::ThreadResumed {
            thread: self.id,
            state: restored.to_string(),
        });
        Ok(())
    }

    /// Move to Terminated and drop every pending job unexecuted
    ///
    /// Idempotent. A parked thread is woken and sees `ThreadTerminated`.
    /// Returns the number of abandoned jobs.
    pub fn terminate(&self) -> usize {
        let mut info = self.suspension.lock();
        if self.state.state() == ThreadState::Terminated {
            return 0;
        }

        self.state.store(StateBits::pack(ThreadState::Terminated, 0));
        info.count = 0;
        info.vm_requested = false;
        if info.vm_pending {
            info.vm_pending = false;
            self.vm_barrier.arrive();
        }
        self.interrupt.set_flag(TERMINATION_BIT);
        self.changed.notify_all();
        drop(info);

        let abandoned = self.jobs.abandon_all();
        if abandoned > 0 {
            self.stats.add(Counter::JobAbandoned, abandoned as u64);
            log::warn!("thread {} terminated with {} pending jobs", self.id, abandoned);
            log_event(SubstrateEvent::JobsAbandoned {
                thread: self.id,
                count: abandoned,
            });
        }
        log::debug!("thread {} terminated", self.id);
        abandoned
    }
}

impl std::fmt::Debug for MutatorThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorThread")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("flags", &self.state_bits().flags())
            .finish()
    }
}

/// Keeps a thread in Native until dropped
#[must_use = "the thread returns to Running when the scope is dropped"]
pub struct NativeScope<'a> {
    thread: &'a MutatorThread,
}

impl Drop for NativeScope<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.thread.leave_native() {
            log::warn!("thread {}: leaving native scope: {}", self.thread.id(), e);
        }
    }
}

/// Keeps a thread in Wait until dropped
#[must_use = "the thread returns to Running when the scope is dropped"]
pub struct WaitScope<'a> {
    thread: &'a MutatorThread,
}

impl Drop for WaitScope<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.thread.leave_wait() {
            log::warn!("thread {}: leaving wait scope: {}", self.thread.id(), e);
        }
    }
}
