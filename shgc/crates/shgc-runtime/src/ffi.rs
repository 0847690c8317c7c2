//! C FFI wrapper for SHGC
//!
//! Every call acting on "the current thread" uses the mutator attached to
//! the calling OS thread by `shgc_attach_thread`. Status-returning calls
//! use the `SHGC_*` codes below.

use anyhow::Context;
use libc::{c_int, c_void};
use parking_lot::Mutex;
use shgc::{BarrierPolicy, Generation, MutatorThread, Runtime, ShgcConfig, ShgcError, TaggedValue};
use std::cell::RefCell;
use std::sync::{Arc, OnceLock};

pub const SHGC_OK: c_int = 0;
pub const SHGC_ERROR: c_int = -1;
pub const SHGC_OUT_OF_MEMORY: c_int = -2;
pub const SHGC_TERMINATED: c_int = -3;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Serializes `shgc_init` so only one heap reservation is ever made
static INIT: Mutex<()> = Mutex::new(());

thread_local! {
    static CURRENT: RefCell<Option<Arc<MutatorThread>>> = const { RefCell::new(None) };
}

fn runtime() -> anyhow::Result<&'static Runtime> {
    RUNTIME.get().context("substrate not initialized")
}

fn current() -> anyhow::Result<Arc<MutatorThread>> {
    CURRENT
        .with(|c| c.borrow().clone())
        .context("calling thread is not attached")
}

fn with_current<T>(
    what: &'static str,
    f: impl FnOnce(&Runtime, &MutatorThread) -> shgc::Result<T>,
) -> anyhow::Result<T> {
    let runtime = runtime()?;
    let thread = current()?;
    f(runtime, &thread).with_context(|| format!("{} on thread {}", what, thread.id()))
}

fn status(result: anyhow::Result<()>) -> c_int {
    match result {
        Ok(()) => SHGC_OK,
        Err(e) => {
            log::error!("{:#}", e);
            match e.downcast_ref::<ShgcError>() {
                Some(ShgcError::OutOfMemory { .. }) => SHGC_OUT_OF_MEMORY,
                Some(ShgcError::ThreadTerminated { .. }) => SHGC_TERMINATED,
                _ => SHGC_ERROR,
            }
        },
    }
}

fn policy_from(code: c_int) -> anyhow::Result<BarrierPolicy> {
    match code {
        0 => Ok(BarrierPolicy::NoBarrier),
        1 => Ok(BarrierPolicy::NeedBarrier),
        2 => Ok(BarrierPolicy::UnknownBarrier),
        other => anyhow::bail!("unknown barrier policy {}", other),
    }
}

fn generation_from(code: c_int) -> anyhow::Result<Generation> {
    match code {
        0 => Ok(Generation::Young),
        1 => Ok(Generation::Old),
        2 => Ok(Generation::SharedOld),
        3 => Ok(Generation::SharedNonMovable),
        other => anyhow::bail!("unknown generation {}", other),
    }
}

/// Create the process-wide runtime from `SHGC_*` environment variables
#[no_mangle]
pub extern "C" fn shgc_init() -> bool {
    if RUNTIME.get().is_some() {
        return true;
    }

    let _guard = INIT.lock();
    if RUNTIME.get().is_some() {
        return true;
    }
    match Runtime::new(ShgcConfig::from_env()) {
        Ok(runtime) => {
            if RUNTIME.set(runtime).is_err() {
                log::error!("substrate runtime initialized outside shgc_init");
                return false;
            }
            true
        },
        Err(e) => {
            log::error!("failed to create substrate runtime: {}", e);
            false
        },
    }
}

/// Register and start a mutator for the calling OS thread
///
/// Returns the thread id, or 0 on failure.
#[no_mangle]
pub extern "C" fn shgc_attach_thread() -> u32 {
    let attached = (|| -> anyhow::Result<u32> {
        if let Ok(thread) = current() {
            return Ok(thread.id());
        }
        let runtime = runtime()?;
        let thread = runtime.create_thread().context("registering mutator")?;
        thread.start().context("starting mutator")?;
        let id = thread.id();
        CURRENT.with(|c| *c.borrow_mut() = Some(thread));
        Ok(id)
    })();

    attached.unwrap_or_else(|e| {
        log::error!("{:#}", e);
        0
    })
}

/// Terminate and unregister the calling thread's mutator
#[no_mangle]
pub extern "C" fn shgc_detach_thread() -> c_int {
    status((|| -> anyhow::Result<()> {
        let runtime = runtime()?;
        let thread = match CURRENT.with(|c| c.borrow_mut().take()) {
            Some(thread) => thread,
            None => return Ok(()),
        };
        runtime
            .destroy_thread(&thread)
            .with_context(|| format!("detaching thread {}", thread.id()))?;
        Ok(())
    })())
}

/// Store a raw tagged value into `object + offset`
#[no_mangle]
pub extern "C" fn shgc_store(object: usize, offset: usize, value: u64, policy: c_int) -> c_int {
    status(policy_from(policy).and_then(|policy| {
        with_current("store", |rt, thread| {
            rt.store(thread, object, offset, TaggedValue::from_raw(value), policy)
        })
    }))
}

/// Run the batched barrier over `count` slots already written at `dst`
#[no_mangle]
pub extern "C" fn shgc_store_batch(dst: usize, count: usize) -> c_int {
    status(with_current("batched barrier", |rt, thread| {
        rt.store_batch(thread, dst, count)
    }))
}

/// Copy `count` slots from `src` to `dst` with the batched barrier
#[no_mangle]
pub extern "C" fn shgc_copy_slots(dst: usize, src: usize, count: usize) -> c_int {
    status(with_current("slot copy", |rt, thread| {
        rt.copy_slots(thread, dst, src, count)
    }))
}

/// Allocate `size` bytes; null on failure
#[no_mangle]
pub extern "C" fn shgc_allocate(generation: c_int, size: usize) -> *mut c_void {
    let result = generation_from(generation).and_then(|generation| {
        with_current("allocation", |rt, thread| rt.allocate(thread, generation, size))
    });
    match result {
        Ok(addr) => addr as *mut c_void,
        Err(e) => {
            log::error!("{:#}", e);
            std::ptr::null_mut()
        },
    }
}

#[no_mangle]
pub extern "C" fn shgc_poll_safepoint() -> c_int {
    status(with_current("safepoint poll", |rt, thread| rt.poll_safepoint(thread)))
}

#[no_mangle]
pub extern "C" fn shgc_enter_native() -> c_int {
    status(with_current("enter native", |_, thread| thread.enter_native()))
}

#[no_mangle]
pub extern "C" fn shgc_leave_native() -> c_int {
    status(with_current("leave native", |_, thread| thread.leave_native()))
}

/// Suspend every other thread and wait until all are parked
///
/// An attached caller is excluded from the suspension.
#[no_mangle]
pub extern "C" fn shgc_request_suspend_all() -> c_int {
    status((|| -> anyhow::Result<()> {
        let runtime = runtime()?;
        let requester = current().ok();
        runtime
            .request_suspend_all(requester.as_deref())
            .context("VM-wide suspend request")?;
        Ok(())
    })())
}

#[no_mangle]
pub extern "C" fn shgc_wait_all_suspended() -> c_int {
    status((|| -> anyhow::Result<()> {
        let runtime = runtime()?;
        let waiter = current().ok();
        runtime
            .wait_all_suspended(waiter.as_deref())
            .context("waiting for VM-wide suspension")?;
        Ok(())
    })())
}

#[no_mangle]
pub extern "C" fn shgc_resume_all() -> c_int {
    status((|| -> anyhow::Result<()> {
        runtime()?.resume_all().context("lifting VM-wide suspension")?;
        Ok(())
    })())
}

/// Run the calling thread's pending microtasks
///
/// Returns the number of jobs run, or a negative status.
#[no_mangle]
pub extern "C" fn shgc_drain_jobs() -> c_int {
    match with_current("job drain", |rt, thread| rt.drain_jobs(thread)) {
        Ok(outcome) => c_int::try_from(outcome.ran).unwrap_or(c_int::MAX),
        Err(e) => status(Err(e)),
    }
}

/// Terminate every mutator
#[no_mangle]
pub extern "C" fn shgc_shutdown() {
    if let Some(runtime) = RUNTIME.get() {
        if let Err(e) = runtime.shutdown() {
            log::error!("substrate shutdown failed: {}", e);
        }
    }
    CURRENT.with(|c| c.borrow_mut().take());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_init_creates_one_runtime() {
        let handles: Vec<_> = (0..8).map(|_| std::thread::spawn(|| shgc_init())).collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        let first = runtime().unwrap() as *const Runtime;
        assert!(shgc_init());
        assert_eq!(runtime().unwrap() as *const Runtime, first);
    }

    #[test]
    fn test_attach_allocate_store_detach() {
        assert!(shgc_init());
        let id = shgc_attach_thread();
        assert_ne!(id, 0);
        assert_eq!(shgc_attach_thread(), id);

        let old = shgc_allocate(1, 64) as usize;
        let young = shgc_allocate(0, 16) as usize;
        assert_ne!(old, 0);
        assert_ne!(young, 0);

        let value = TaggedValue::from_object(young).raw();
        assert_eq!(shgc_store(old, 8, value, 1), SHGC_OK);
        assert_eq!(shgc_store(old, 8, value, 7), SHGC_ERROR);
        assert_eq!(shgc_poll_safepoint(), SHGC_OK);
        assert_eq!(shgc_drain_jobs(), 0);

        assert_eq!(shgc_enter_native(), SHGC_OK);
        assert_eq!(shgc_leave_native(), SHGC_OK);

        assert_eq!(shgc_detach_thread(), SHGC_OK);
        assert!(shgc_allocate(0, 16).is_null());
    }
}
