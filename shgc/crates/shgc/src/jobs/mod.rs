//! Micro Job Queue - Deferred Callables Drained Between Safepoints
//!
//! Each mutator owns two strict FIFOs of pending jobs:
//! - **Promise**: promise reactions, drained first
//! - **Script**: whole script jobs, drained after promise jobs run dry
//!
//! Insertion order is execution order within a kind. A popped job is never
//! put back by the queue; a job that wants to run again enqueues itself.
//!
//! Draining stops at the first failing job and leaves the rest queued.
//! Once the owning thread is terminated every pending job is dropped in one
//! step under the queue lock and never runs.
//!
//! The queue lock is released while a job runs, so jobs may enqueue more
//! jobs on the same queue.

use crate::error::{Result, ShgcError};
use crate::value::TaggedValue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;

/// Which FIFO a job goes into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Promise,
    Script,
}

/// Failure raised by a job's callable
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct JobError {
    pub message: String,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Boxed job body, called once with the captured arguments
pub type JobCallable = Box<dyn FnOnce(&[TaggedValue]) -> std::result::Result<(), JobError> + Send>;

/// A queued job
pub struct PendingJob {
    callable: JobCallable,
    args: Vec<TaggedValue>,
    enqueue_order: u64,
}

impl PendingJob {
    pub fn args(&self) -> &[TaggedValue] {
        &self.args
    }

    pub fn enqueue_order(&self) -> u64 {
        self.enqueue_order
    }

    fn run(self) -> std::result::Result<(), (u64, JobError)> {
        let order = self.enqueue_order;
        (self.callable)(&self.args).map_err(|e| (order, e))
    }
}

impl std::fmt::Debug for PendingJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingJob")
            .field("enqueue_order", &self.enqueue_order)
            .field("args", &self.args)
            .finish()
    }
}

/// Result of a drain pass that did not fail
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Jobs executed to completion
    pub ran: usize,
    /// Jobs dropped because the thread terminated
    pub abandoned: usize,
}

#[derive(Default)]
struct Queues {
    promise: VecDeque<PendingJob>,
    script: VecDeque<PendingJob>,
}

impl Queues {
    fn of(&mut self, kind: QueueKind) -> &mut VecDeque<PendingJob> {
        match kind {
            QueueKind::Promise => &mut self.promise,
            QueueKind::Script => &mut self.script,
        }
    }

    fn pop_next(&mut self) -> Option<PendingJob> {
        self.promise.pop_front().or_else(|| self.script.pop_front())
    }
}

/// Per-thread pair of job FIFOs
pub struct MicroJobQueue {
    queues: Mutex<Queues>,
    next_order: AtomicU64,
    terminated: AtomicBool,
    abandoned: AtomicUsize,
}

impl MicroJobQueue {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            next_order: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
            abandoned: AtomicUsize::new(0),
        }
    }

    /// Append a job to the tail of `kind`
    ///
    /// # Returns
    /// The job's enqueue order, or `Err(ShgcError::ThreadTerminated)` from
    /// `thread` once its queue has been abandoned.
    pub fn enqueue<F>(
        &self,
        thread: u32,
        kind: QueueKind,
        callable: F,
        args: Vec<TaggedValue>,
    ) -> Result<u64>
    where
        F: FnOnce(&[TaggedValue]) -> std::result::Result<(), JobError> + Send + 'static,
    {
        let mut queues = self.queues.lock();
        if self.terminated.load(Ordering::Acquire) {
            return Err(ShgcError::ThreadTerminated { thread });
        }
        let enqueue_order = self.next_order.fetch_add(1, Ordering::Relaxed);
        queues.of(kind).push_back(PendingJob {
            callable: Box::new(callable),
            args,
            enqueue_order,
        });
        Ok(enqueue_order)
    }

    /// Run pending jobs until both FIFOs are empty
    ///
    /// # Returns
    /// * `Err(ShgcError::JobFailed)` - a job raised; later jobs stay queued
    pub fn drain(&self) -> Result<DrainOutcome> {
        let mut outcome = DrainOutcome::default();
        let was_terminated = self.terminated.load(Ordering::Acquire);
        loop {
            let job = {
                let mut queues = self.queues.lock();
                if self.terminated.load(Ordering::Acquire) {
                    // Terminated by one of the jobs run in this pass.
                    if !was_terminated {
                        outcome.abandoned = self.abandoned.load(Ordering::Relaxed);
                    }
                    return Ok(outcome);
                }
                match queues.pop_next() {
                    Some(job) => job,
                    None => return Ok(outcome),
                }
            };

            if let Err((order, e)) = job.run() {
                log::debug!("job #{} failed, draining stopped: {}", order, e);
                return Err(ShgcError::JobFailed {
                    order,
                    message: e.message,
                });
            }
            outcome.ran += 1;
        }
    }

    /// Drop every pending job and refuse new ones
    ///
    /// Returns the number of jobs abandoned.
    pub fn abandon_all(&self) -> usize {
        let mut queues = self.queues.lock();
        self.terminated.store(true, Ordering::Release);
        let count = queues.promise.len() + queues.script.len();
        queues.promise.clear();
        queues.script.clear();
        self.abandoned.fetch_add(count, Ordering::Relaxed);
        count
    }

    pub fn is_abandoned(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn len(&self, kind: QueueKind) -> usize {
        self.queues.lock().of(kind).len()
    }

    pub fn is_empty(&self) -> bool {
        let queues = self.queues.lock();
        queues.promise.is_empty() && queues.script.is_empty()
    }

    /// Visit every captured argument, for root scanning
    pub fn for_each_argument<F: FnMut(TaggedValue)>(&self, mut visit: F) {
        let queues = self.queues.lock();
        for job in queues.promise.iter().chain(queues.script.iter()) {
            job.args.iter().copied().for_each(&mut visit);
        }
    }
}

impl Default for MicroJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<i32>>>, impl Fn(i32) -> JobCallable) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |tag: i32| -> JobCallable {
            let sink = Arc::clone(&sink);
            Box::new(move |_args: &[TaggedValue]| {
                sink.lock().push(tag);
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn test_fifo_per_kind_promise_first() {
        let queue = MicroJobQueue::new();
        let (log, job) = recorder();

        queue.enqueue(1, QueueKind::Script, job(10), vec![]).unwrap();
        queue.enqueue(1, QueueKind::Promise, job(1), vec![]).unwrap();
        queue.enqueue(1, QueueKind::Promise, job(2), vec![]).unwrap();
        queue.enqueue(1, QueueKind::Script, job(11), vec![]).unwrap();

        let outcome = queue.drain().unwrap();
        assert_eq!(outcome.ran, 4);
        assert_eq!(*log.lock(), vec![1, 2, 10, 11]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_failure_stops_and_keeps_rest() {
        let queue = MicroJobQueue::new();
        let (log, job) = recorder();

        queue.enqueue(1, QueueKind::Promise, job(1), vec![]).unwrap();
        let failing = queue
            .enqueue(
                1,
                QueueKind::Promise,
                |_: &[TaggedValue]| Err(JobError::new("rejected")),
                vec![],
            )
            .unwrap();
        queue.enqueue(1, QueueKind::Promise, job(3), vec![]).unwrap();

        match queue.drain() {
            Err(ShgcError::JobFailed { order, message }) => {
                assert_eq!(order, failing);
                assert_eq!(message, "rejected");
            },
            other => panic!("expected JobFailed, got {:?}", other),
        }
        assert_eq!(*log.lock(), vec![1]);
        assert_eq!(queue.len(QueueKind::Promise), 1);

        queue.drain().unwrap();
        assert_eq!(*log.lock(), vec![1, 3]);
    }

    #[test]
    fn test_abandon_refuses_new_jobs() {
        let queue = MicroJobQueue::new();
        let (log, job) = recorder();
        queue.enqueue(7, QueueKind::Promise, job(1), vec![]).unwrap();

        assert_eq!(queue.abandon_all(), 1);
        assert!(matches!(
            queue.enqueue(7, QueueKind::Promise, job(2), vec![]),
            Err(ShgcError::ThreadTerminated { thread: 7 })
        ));
        assert_eq!(queue.drain().unwrap(), DrainOutcome::default());
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_jobs_see_their_arguments() {
        let queue = MicroJobQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        queue
            .enqueue(
                1,
                QueueKind::Promise,
                move |args: &[TaggedValue]| {
                    sink.lock().extend(args.iter().filter_map(|v| v.as_int()));
                    Ok(())
                },
                vec![TaggedValue::from_int(4), TaggedValue::from_int(5)],
            )
            .unwrap();

        let mut roots = Vec::new();
        queue.for_each_argument(|v| roots.push(v));
        assert_eq!(roots.len(), 2);

        queue.drain().unwrap();
        assert_eq!(*seen.lock(), vec![4, 5]);
    }

    #[test]
    fn test_job_terminating_its_thread_reports_abandoned() {
        let queue = Arc::new(MicroJobQueue::new());
        let (log, job) = recorder();
        let inner = Arc::clone(&queue);

        queue
            .enqueue(
                1,
                QueueKind::Promise,
                move |_: &[TaggedValue]| {
                    inner.abandon_all();
                    Ok(())
                },
                vec![],
            )
            .unwrap();
        queue.enqueue(1, QueueKind::Promise, job(2), vec![]).unwrap();
        queue.enqueue(1, QueueKind::Script, job(3), vec![]).unwrap();

        let outcome = queue.drain().unwrap();
        assert_eq!(outcome, DrainOutcome { ran: 1, abandoned: 2 });
        assert!(log.lock().is_empty());
    }
}
