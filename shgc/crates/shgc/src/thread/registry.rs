//! Thread Registry
//!
//! Insertion-ordered map of every registered mutator, plus the state that
//! has to be applied to a thread the moment it registers:
//! - the current shared-heap mark status
//! - an active VM-wide suspension, which parks the newcomer immediately
//!
//! Lock order: `vm` before `threads` before a thread's own suspension lock.

use crate::error::{Result, ShgcError};
use crate::logging::{log_event, SubstrateEvent};
use crate::marker::mark_state::VM_SUSPENSION_BIT;
use crate::marker::SharedMarkStatus;
use crate::runtime::safepoint::SuspendBarrier;
use crate::stats::SubstrateStats;
use crate::thread::mutator::MutatorThread;
use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Bookkeeping of the VM-wide suspension
#[derive(Debug, Default)]
pub(crate) struct VmSuspension {
    pub(crate) active: bool,
    pub(crate) requester: Option<u32>,
    /// Threads this suspension requested, resumed together by `resume_all`
    pub(crate) requested: Vec<Arc<MutatorThread>>,
}

/// Registry of mutator threads
pub struct ThreadRegistry {
    threads: RwLock<IndexMap<u32, Arc<MutatorThread>>>,
    next_id: AtomicU32,
    vm: Mutex<VmSuspension>,
    vm_barrier: Arc<SuspendBarrier>,
    shared_marking: AtomicBool,
    stats: Arc<SubstrateStats>,
}

impl ThreadRegistry {
    pub fn new(stats: Arc<SubstrateStats>) -> Self {
        Self {
            threads: RwLock::new(IndexMap::new()),
            next_id: AtomicU32::new(1),
            vm: Mutex::new(VmSuspension::default()),
            vm_barrier: Arc::new(SuspendBarrier::new()),
            shared_marking: AtomicBool::new(false),
            stats,
        }
    }

    pub(crate) fn vm_barrier(&self) -> &Arc<SuspendBarrier> {
        &self.vm_barrier
    }

    pub(crate) fn vm_state(&self) -> MutexGuard<'_, VmSuspension> {
        self.vm.lock()
    }

    /// Create and register a thread in state Created
    ///
    /// The thread inherits the current shared mark status. During an
    /// active VM-wide suspension it is suspended before this returns.
    pub fn register(&self) -> Result<Arc<MutatorThread>> {
        let mut vm = self.vm.lock();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let thread = Arc::new(MutatorThread::new(
            id,
            Arc::clone(&self.vm_barrier),
            Arc::clone(&self.stats),
        ));

        {
            let mut threads = self.threads.write();
            if self.shared_marking.load(Ordering::Acquire) {
                thread
                    .interrupt()
                    .set_shared_mark(SharedMarkStatus::ConcurrentMarkingOrFinished);
            }
            threads.insert(id, Arc::clone(&thread));
        }

        if vm.active {
            thread.request_suspend(true)?;
            thread.interrupt().set_flag(VM_SUSPENSION_BIT);
            vm.requested.push(Arc::clone(&thread));
            log::debug!("thread {} registered during VM suspension, parked", id);
        }

        log::debug!("registered thread {}", id);
        Ok(thread)
    }

    /// Terminate and remove a thread
    pub fn unregister(&self, id: u32) -> Result<Arc<MutatorThread>> {
        let thread = self
            .threads
            .write()
            .shift_remove(&id)
            .ok_or(ShgcError::UnknownThread { thread: id })?;
        thread.terminate();
        log::debug!("unregistered thread {}", id);
        Ok(thread)
    }

    pub fn get(&self, id: u32) -> Result<Arc<MutatorThread>> {
        self.threads
            .read()
            .get(&id)
            .cloned()
            .ok_or(ShgcError::UnknownThread { thread: id })
    }

    /// Registered threads in registration order
    pub fn snapshot(&self) -> Vec<Arc<MutatorThread>> {
        self.threads.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }

    /// Current shared mark status applied to new threads
    pub fn shared_mark_status(&self) -> SharedMarkStatus {
        if self.shared_marking.load(Ordering::Acquire) {
            SharedMarkStatus::ConcurrentMarkingOrFinished
        } else {
            SharedMarkStatus::ReadyToMark
        }
    }

    /// Publish a shared mark status to every registered thread
    ///
    /// Returns the number of threads updated.
    pub fn broadcast_shared_mark_status(&self, status: SharedMarkStatus) -> usize {
        let threads = self.threads.read();
        self.shared_marking.store(
            status == SharedMarkStatus::ConcurrentMarkingOrFinished,
            Ordering::Release,
        );
        for thread in threads.values() {
            thread.interrupt().set_shared_mark(status);
        }

        log::info!("shared mark status -> {:?} on {} threads", status, threads.len());
        log_event(SubstrateEvent::MarkStatusChanged {
            heap: "shared".to_string(),
            status: format!("{:?}", status),
            threads: threads.len(),
        });
        threads.len()
    }
}

impl std::fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("threads", &self.len())
            .field("shared_mark", &self.shared_mark_status())
            .finish()
    }
}
