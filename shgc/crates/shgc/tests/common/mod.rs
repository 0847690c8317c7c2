//! Shared fixtures for the integration suite

#![allow(dead_code)]

use shgc::{Generation, MutatorThread, Runtime, ShgcConfig, SpaceKind};
use std::sync::Arc;
use std::time::Duration;

/// Region size used by the suite (64KB)
pub const REGION_SIZE: usize = 64 * 1024;

/// Slot size in bytes
pub const SLOT: usize = shgc::heap::SLOT_SIZE;

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A runtime plus one started mutator
pub struct RuntimeFixture {
    pub runtime: Arc<Runtime>,
    pub thread: Arc<MutatorThread>,
}

impl RuntimeFixture {
    /// 32 regions of 64KB, one Running thread
    pub fn new() -> Self {
        Self::with_config(ShgcConfig::sized(REGION_SIZE, 32))
    }

    pub fn with_config(config: ShgcConfig) -> Self {
        let runtime = Arc::new(Runtime::new(config).expect("runtime should initialize"));
        let thread = runtime.create_thread().expect("thread registration");
        thread.start().expect("Created -> Running");
        Self { runtime, thread }
    }

    /// Allocate `slots` slots in `generation` on the fixture thread
    pub fn object(&self, generation: Generation, slots: usize) -> usize {
        self.runtime
            .allocate(&self.thread, generation, slots * SLOT)
            .expect("allocation should succeed")
    }

    /// A freshly provisioned region of `kind`, owned by the fixture thread
    pub fn region(&self, kind: SpaceKind) -> usize {
        self.runtime
            .heap()
            .provision_region(kind, self.thread.id())
            .expect("free region")
            .start()
    }
}

impl Drop for RuntimeFixture {
    fn drop(&mut self) {
        let _ = self.runtime.shutdown();
    }
}

/// Spin until `cond` holds or the suite timeout expires
pub fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
    let deadline = std::time::Instant::now() + TEST_TIMEOUT;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::yield_now();
    }
    false
}
