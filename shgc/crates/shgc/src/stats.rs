//! Substrate Statistics
//!
//! Relaxed atomic counters bumped from the barrier, allocation, safepoint
//! and job paths. Counters are only observational; no decision is taken
//! from them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Counters shared by every thread of one runtime
#[derive(Debug)]
pub struct SubstrateStats {
    enabled: AtomicBool,
    stores: AtomicU64,
    barrier_slow_calls: AtomicU64,
    batch_barriers: AtomicU64,
    local_to_shared_inserts: AtomicU64,
    old_to_new_inserts: AtomicU64,
    local_mark_pushes: AtomicU64,
    shared_mark_pushes: AtomicU64,
    fast_allocations: AtomicU64,
    slow_allocations: AtomicU64,
    huge_allocations: AtomicU64,
    allocation_failures: AtomicU64,
    safepoint_polls: AtomicU64,
    safepoint_parks: AtomicU64,
    jobs_run: AtomicU64,
    jobs_abandoned: AtomicU64,
}

/// Plain copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub stores: u64,
    pub barrier_slow_calls: u64,
    pub batch_barriers: u64,
    pub local_to_shared_inserts: u64,
    pub old_to_new_inserts: u64,
    pub local_mark_pushes: u64,
    pub shared_mark_pushes: u64,
    pub fast_allocations: u64,
    pub slow_allocations: u64,
    pub huge_allocations: u64,
    pub allocation_failures: u64,
    pub safepoint_polls: u64,
    pub safepoint_parks: u64,
    pub jobs_run: u64,
    pub jobs_abandoned: u64,
}

/// Which counter to bump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Store,
    BarrierSlowCall,
    BatchBarrier,
    LocalToSharedInsert,
    OldToNewInsert,
    LocalMarkPush,
    SharedMarkPush,
    FastAllocation,
    SlowAllocation,
    HugeAllocation,
    AllocationFailure,
    SafepointPoll,
    SafepointPark,
    JobRun,
    JobAbandoned,
}

impl SubstrateStats {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            stores: AtomicU64::new(0),
            barrier_slow_calls: AtomicU64::new(0),
            batch_barriers: AtomicU64::new(0),
            local_to_shared_inserts: AtomicU64::new(0),
            old_to_new_inserts: AtomicU64::new(0),
            local_mark_pushes: AtomicU64::new(0),
            shared_mark_pushes: AtomicU64::new(0),
            fast_allocations: AtomicU64::new(0),
            slow_allocations: AtomicU64::new(0),
            huge_allocations: AtomicU64::new(0),
            allocation_failures: AtomicU64::new(0),
            safepoint_polls: AtomicU64::new(0),
            safepoint_parks: AtomicU64::new(0),
            jobs_run: AtomicU64::new(0),
            jobs_abandoned: AtomicU64::new(0),
        }
    }

    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Store => &self.stores,
            Counter::BarrierSlowCall => &self.barrier_slow_calls,
            Counter::BatchBarrier => &self.batch_barriers,
            Counter::LocalToSharedInsert => &self.local_to_shared_inserts,
            Counter::OldToNewInsert => &self.old_to_new_inserts,
            Counter::LocalMarkPush => &self.local_mark_pushes,
            Counter::SharedMarkPush => &self.shared_mark_pushes,
            Counter::FastAllocation => &self.fast_allocations,
            Counter::SlowAllocation => &self.slow_allocations,
            Counter::HugeAllocation => &self.huge_allocations,
            Counter::AllocationFailure => &self.allocation_failures,
            Counter::SafepointPoll => &self.safepoint_polls,
            Counter::SafepointPark => &self.safepoint_parks,
            Counter::JobRun => &self.jobs_run,
            Counter::JobAbandoned => &self.jobs_abandoned,
        }
    }

    #[inline]
    pub fn bump(&self, counter: Counter) {
        self.add(counter, 1);
    }

    #[inline]
    pub fn add(&self, counter: Counter, n: u64) {
        if self.enabled.load(Ordering::Relaxed) {
            self.counter(counter).fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            stores: get(&self.stores),
            barrier_slow_calls: get(&self.barrier_slow_calls),
            batch_barriers: get(&self.batch_barriers),
            local_to_shared_inserts: get(&self.local_to_shared_inserts),
            old_to_new_inserts: get(&self.old_to_new_inserts),
            local_mark_pushes: get(&self.local_mark_pushes),
            shared_mark_pushes: get(&self.shared_mark_pushes),
            fast_allocations: get(&self.fast_allocations),
            slow_allocations: get(&self.slow_allocations),
            huge_allocations: get(&self.huge_allocations),
            allocation_failures: get(&self.allocation_failures),
            safepoint_polls: get(&self.safepoint_polls),
            safepoint_parks: get(&self.safepoint_parks),
            jobs_run: get(&self.jobs_run),
            jobs_abandoned: get(&self.jobs_abandoned),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for c in [
            Counter::Store,
            Counter::BarrierSlowCall,
            Counter::BatchBarrier,
            Counter::LocalToSharedInsert,
            Counter::OldToNewInsert,
            Counter::LocalMarkPush,
            Counter::SharedMarkPush,
            Counter::FastAllocation,
            Counter::SlowAllocation,
            Counter::HugeAllocation,
            Counter::AllocationFailure,
            Counter::SafepointPoll,
            Counter::SafepointPark,
            Counter::JobRun,
            Counter::JobAbandoned,
        ] {
            self.counter(c).store(0, Ordering::Relaxed);
        }
    }
}

impl Default for SubstrateStats {
    fn default() -> Self {
        Self::new(true)
    }
}
