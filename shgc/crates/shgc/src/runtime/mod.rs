//! Runtime Module - Substrate Facade
//!
//! Ties the heap, the thread registry and the suspension protocol together
//! behind one handle the embedding VM keeps for its whole lifetime.
//! Manages:
//! - mutator thread lifecycle
//! - barriered stores and allocation
//! - per-thread microtask queues
//! - thread and VM-wide suspension
//! - mark status publication for the collectors

pub mod safepoint;

pub use safepoint::{SafepointProtocol, SuspendBarrier};

use crate::allocator::{self, CollectorHooks, NoCollector};
use crate::barrier::{self, BarrierPolicy};
use crate::config::ShgcConfig;
use crate::error::{Result, ShgcError};
use crate::heap::{Generation, Heap};
use crate::jobs::{DrainOutcome, JobError, QueueKind};
use crate::logging::{configure_logger, log_event, EventLoggerConfig, SubstrateEvent};
use crate::marker::{LocalMarkStatus, SharedMarkStatus};
use crate::stats::{Counter, StatsSnapshot, SubstrateStats};
use crate::thread::{MutatorThread, ThreadRegistry};
use crate::value::TaggedValue;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Runtime - substrate orchestrator
pub struct Runtime {
    heap: Heap,
    registry: Arc<ThreadRegistry>,
    safepoint: SafepointProtocol,
    hooks: RwLock<Arc<dyn CollectorHooks>>,
    stats: Arc<SubstrateStats>,
    state: Mutex<RuntimeState>,
}

/// Runtime state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Accepting threads and operations
    Running,
    /// `shutdown` in progress
    Stopping,
    /// Every thread terminated; only queries remain valid
    Stopped,
}

impl Runtime {
    /// Create a runtime with its heap reservation
    ///
    /// # Returns
    /// * `Err(ShgcError::Configuration)` - invalid `config`
    /// * `Err(ShgcError::HeapInitialization)` - the reservation failed
    pub fn new(config: ShgcConfig) -> Result<Self> {
        if config.verbose {
            configure_logger(EventLoggerConfig::verbose());
        }

        let stats = Arc::new(SubstrateStats::new(config.stats_enabled));
        let heap = Heap::new(config, Arc::clone(&stats))?;
        let registry = Arc::new(ThreadRegistry::new(Arc::clone(&stats)));

        log::info!(
            "substrate up: {} regions of {} bytes",
            heap.config().max_regions,
            heap.region_size()
        );

        Ok(Self {
            heap,
            safepoint: SafepointProtocol::new(Arc::clone(&registry)),
            registry,
            hooks: RwLock::new(Arc::new(NoCollector)),
            stats,
            state: Mutex::new(RuntimeState::Running),
        })
    }

    /// Install the collector callbacks
    pub fn set_collector_hooks(&self, hooks: Arc<dyn CollectorHooks>) {
        *self.hooks.write() = hooks;
    }

    /// Builder form of [`set_collector_hooks`](Self::set_collector_hooks)
    pub fn with_hooks(self, hooks: Arc<dyn CollectorHooks>) -> Self {
        self.set_collector_hooks(hooks);
        self
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    pub fn safepoint(&self) -> &SafepointProtocol {
        &self.safepoint
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.lock()
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            RuntimeState::Running => Ok(()),
            state => Err(ShgcError::InvalidArgument(format!(
                "runtime is {:?}",
                state
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Thread lifecycle
    // ------------------------------------------------------------------

    /// Register a new mutator; it starts in `Created`
    pub fn create_thread(&self) -> Result<Arc<MutatorThread>> {
        self.ensure_running()?;
        self.registry.register()
    }

    /// Look up a registered mutator
    pub fn thread(&self, id: u32) -> Result<Arc<MutatorThread>> {
        self.registry.get(id)
    }

    /// Terminate and unregister `thread`, releasing its local regions
    ///
    /// Returns the number of regions released.
    pub fn destroy_thread(&self, thread: &MutatorThread) -> Result<usize> {
        self.registry.unregister(thread.id())?;
        let released = self.heap.release_owned_by(thread.id());
        log::debug!("thread {} destroyed, {} regions released", thread.id(), released);
        Ok(released)
    }

    /// Terminate `thread` without unregistering it
    ///
    /// Returns the number of microtasks abandoned.
    pub fn terminate(&self, thread: &MutatorThread) -> usize {
        thread.terminate()
    }

    // ------------------------------------------------------------------
    // Mutator operations
    // ------------------------------------------------------------------

    /// Store `value` into field `offset` of `object` with the write barrier
    pub fn store(
        &self,
        thread: &MutatorThread,
        object: usize,
        offset: usize,
        value: TaggedValue,
        policy: BarrierPolicy,
    ) -> Result<()> {
        barrier::store(&self.heap, thread, object, offset, value, policy)
    }

    /// Batched barrier for `count` slots already written at `dst`
    pub fn store_batch(&self, thread: &MutatorThread, dst: usize, count: usize) -> Result<()> {
        barrier::barrier_batch_bitset(&self.heap, thread, dst, count)
    }

    /// Copy `count` slots and run the batched barrier over the destination
    pub fn copy_slots(
        &self,
        thread: &MutatorThread,
        dst: usize,
        src: usize,
        count: usize,
    ) -> Result<()> {
        barrier::copy_slots_with_barrier(&self.heap, thread, dst, src, count)
    }

    /// Allocate `size` bytes in `generation`
    pub fn allocate(
        &self,
        thread: &MutatorThread,
        generation: Generation,
        size: usize,
    ) -> Result<usize> {
        let hooks = Arc::clone(&*self.hooks.read());
        allocator::allocate(&self.heap, thread, generation, size, hooks.as_ref())
    }

    /// Safepoint poll for a Running `thread`
    #[inline]
    pub fn poll_safepoint(&self, thread: &MutatorThread) -> Result<()> {
        thread.poll_safepoint()
    }

    // ------------------------------------------------------------------
    // Microtasks
    // ------------------------------------------------------------------

    /// Queue a job on `thread`
    pub fn enqueue_job<F>(
        &self,
        thread: &MutatorThread,
        kind: QueueKind,
        callable: F,
        args: Vec<TaggedValue>,
    ) -> Result<u64>
    where
        F: FnOnce(&[TaggedValue]) -> std::result::Result<(), JobError> + Send + 'static,
    {
        thread.jobs().enqueue(thread.id(), kind, callable, args)
    }

    /// Run `thread`'s pending jobs
    pub fn drain_jobs(&self, thread: &MutatorThread) -> Result<DrainOutcome> {
        let result = thread.jobs().drain();
        match &result {
            Ok(outcome) => self.stats.add(Counter::JobRun, outcome.ran as u64),
            Err(e) => log::warn!("thread {}: job drain stopped: {}", thread.id(), e),
        }
        result
    }

    // ------------------------------------------------------------------
    // Suspension
    // ------------------------------------------------------------------

    pub fn request_suspend(&self, thread: &MutatorThread) -> Result<()> {
        self.safepoint.request_suspend(thread)
    }

    pub fn wait_suspended(
        &self,
        thread: &MutatorThread,
        waiter: Option<&MutatorThread>,
    ) -> Result<()> {
        self.safepoint.wait_suspended(thread, waiter)
    }

    pub fn resume(&self, thread: &MutatorThread) -> Result<()> {
        self.safepoint.resume(thread)
    }

    pub fn request_suspend_all(&self, requester: Option<&MutatorThread>) -> Result<usize> {
        self.safepoint.request_suspend_all(requester)
    }

    pub fn wait_all_suspended(&self, waiter: Option<&MutatorThread>) -> Result<()> {
        self.safepoint.wait_all_suspended(waiter)
    }

    pub fn resume_all(&self) -> Result<usize> {
        self.safepoint.resume_all()
    }

    /// Suspend every thread except `requester` and wait for all of them
    ///
    /// The returned guard resumes them when dropped.
    pub fn stop_the_world(&self, requester: Option<&MutatorThread>) -> Result<StopTheWorld<'_>> {
        let threads = self.safepoint.request_suspend_all(requester)?;
        if let Err(e) = self.safepoint.wait_all_suspended(requester) {
            let _ = self.safepoint.resume_all();
            return Err(e);
        }
        Ok(StopTheWorld {
            runtime: self,
            threads,
        })
    }

    // ------------------------------------------------------------------
    // Mark status
    // ------------------------------------------------------------------

    /// Set the local collector's mark status on `thread`
    pub fn set_local_mark_status(&self, thread: &MutatorThread, status: LocalMarkStatus) {
        let previous = thread.interrupt().set_local_mark(status);
        if previous != status {
            log::debug!(
                "thread {}: local mark status {:?} -> {:?}",
                thread.id(),
                previous,
                status
            );
            log_event(SubstrateEvent::MarkStatusChanged {
                heap: "local".to_string(),
                status: format!("{:?}", status),
                threads: 1,
            });
        }
    }

    /// Publish the shared collector's mark status to every thread
    pub fn broadcast_shared_mark_status(&self, status: SharedMarkStatus) -> usize {
        self.registry.broadcast_shared_mark_status(status)
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Terminate every registered thread
    ///
    /// Parked threads are released by termination; their queued jobs are
    /// abandoned. Returns the number of threads terminated.
    pub fn shutdown(&self) -> Result<usize> {
        {
            let mut state = self.state.lock();
            if *state != RuntimeState::Running {
                return Ok(0);
            }
            *state = RuntimeState::Stopping;
        }

        if self.safepoint.is_vm_suspension_active() {
            self.safepoint.resume_all()?;
        }

        let threads = self.registry.snapshot();
        for thread in &threads {
            self.registry.unregister(thread.id())?;
            self.heap.release_owned_by(thread.id());
        }

        *self.state.lock() = RuntimeState::Stopped;
        log::info!("substrate stopped: {} threads terminated", threads.len());
        Ok(threads.len())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state())
            .field("heap", &self.heap)
            .field("registry", &self.registry)
            .finish()
    }
}

/// VM-wide suspension held for the guard's lifetime
pub struct StopTheWorld<'a> {
    runtime: &'a Runtime,
    threads: usize,
}

impl StopTheWorld<'_> {
    /// Threads parked by this suspension
    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl Drop for StopTheWorld<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.resume_all() {
            log::error!("failed to lift VM suspension: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::SpaceKind;
    use crate::thread::ThreadState;

    fn runtime() -> Runtime {
        Runtime::new(ShgcConfig::sized(64 * 1024, 16)).unwrap()
    }

    #[test]
    fn test_thread_lifecycle_releases_regions() {
        let rt = runtime();
        let thread = rt.create_thread().unwrap();
        thread.start().unwrap();

        rt.allocate(&thread, Generation::Young, 64).unwrap();
        rt.allocate(&thread, Generation::Old, 64).unwrap();
        assert_eq!(rt.heap().regions_in_use(), 2);

        assert_eq!(rt.destroy_thread(&thread).unwrap(), 2);
        assert_eq!(rt.heap().regions_in_use(), 0);
        assert_eq!(thread.state(), ThreadState::Terminated);
        assert!(rt.thread(thread.id()).is_err());
    }

    #[test]
    fn test_local_mark_status_per_thread() {
        let rt = runtime();
        let a = rt.create_thread().unwrap();
        let b = rt.create_thread().unwrap();

        rt.set_local_mark_status(&a, LocalMarkStatus::Marking);
        assert!(a.interrupt().load().is_local_marking());
        assert!(!b.interrupt().load().is_local_marking());
    }

    #[test]
    fn test_drain_counts_jobs() {
        let rt = runtime();
        let thread = rt.create_thread().unwrap();
        for _ in 0..3 {
            rt.enqueue_job(&thread, QueueKind::Promise, |_| Ok(()), vec![])
                .unwrap();
        }
        assert_eq!(rt.drain_jobs(&thread).unwrap().ran, 3);
        assert_eq!(rt.stats().jobs_run, 3);
    }

    #[test]
    fn test_stop_the_world_guard_resumes() {
        let rt = runtime();
        let thread = rt.create_thread().unwrap();
        {
            let world = rt.stop_the_world(None).unwrap();
            assert_eq!(world.threads(), 1);
            assert_eq!(thread.state(), ThreadState::Suspended);
        }
        assert_eq!(thread.state(), ThreadState::Created);
        assert!(!rt.safepoint().is_vm_suspension_active());
    }

    #[test]
    fn test_shutdown_rejects_new_threads() {
        let rt = runtime();
        let thread = rt.create_thread().unwrap();
        rt.heap().provision_region(SpaceKind::Young, thread.id()).unwrap();

        assert_eq!(rt.shutdown().unwrap(), 1);
        assert_eq!(rt.state(), RuntimeState::Stopped);
        assert!(rt.create_thread().is_err());
        assert_eq!(rt.heap().regions_in_use(), 0);
    }
}
