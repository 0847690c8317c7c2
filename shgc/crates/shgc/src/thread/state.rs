//! Thread State Word
//!
//! A mutator's state and its protocol flags share one atomic 32-bit word so
//! a transition and the flags it must observe change together:
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────┐
//! │  State (31-16)               │  Flags (15-0)                │
//! └──────────────────────────────┴──────────────────────────────┘
//! Flags: bit 0 SuspendRequested, bit 1 ActiveBarrier
//! ```
//!
//! Mutator fast paths (`Created -> Running`, `Running <-> Native/Wait`) are a
//! single `compare_exchange` that expects the flag half to be zero. Any set
//! flag makes the CAS fail and sends the caller down the locked slow path.
//!
//! # State Machine
//!
//! ```text
//!            start            enter_native / enter_wait
//! Created ─────────▶ Running ◀─────────────────────────▶ Native / Wait
//!    │                  │                                      │
//!    └──────────────────┴────────── protocol ─────────────────┘
//!                            ▼                ▲
//!                        Suspended ── resume ─┘ (back to prior state)
//!
//! any ──terminate──▶ Terminated (final)
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

/// Suspension has been requested and not yet resumed
pub const SUSPEND_REQUESTED: u16 = 1 << 0;

/// The thread still has to reach a poll for a VM-wide suspension
pub const ACTIVE_BARRIER: u16 = 1 << 1;

const STATE_SHIFT: u32 = 16;
const FLAGS_MASK: u32 = 0xFFFF;

/// Mutator thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ThreadState {
    /// Registered, has not run managed code yet
    Created = 0,
    /// Executing managed code, polls for suspension
    Running = 1,
    /// Executing native code, managed frames frozen
    Native = 2,
    /// Blocked inside a protocol wait, managed frames frozen
    Wait = 3,
    /// Parked by the suspension protocol
    Suspended = 4,
    /// Final state
    Terminated = 5,
}

impl TryFrom<u16> for ThreadState {
    type Error = u16;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(ThreadState::Created),
            1 => Ok(ThreadState::Running),
            2 => Ok(ThreadState::Native),
            3 => Ok(ThreadState::Wait),
            4 => Ok(ThreadState::Suspended),
            5 => Ok(ThreadState::Terminated),
            other => Err(other),
        }
    }
}

impl ThreadState {

    /// Managed frames are frozen, so the protocol may park the thread
    /// without its cooperation
    pub fn is_parkable_on_behalf(self) -> bool {
        matches!(
            self,
            ThreadState::Created | ThreadState::Native | ThreadState::Wait
        )
    }

    pub fn is_terminated(self) -> bool {
        self == ThreadState::Terminated
    }
}

impl std::fmt::Display for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Decoded copy of a state word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateBits(u32);

impl StateBits {
    #[inline]
    pub fn pack(state: ThreadState, flags: u16) -> Self {
        StateBits(((state as u32) << STATE_SHIFT) | flags as u32)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Decode the state half
    ///
    /// A word holding no valid state is corrupt: debug builds assert, release
    /// builds log it and report Terminated so the thread is never resumed.
    #[inline]
    pub fn state(self) -> ThreadState {
        match ThreadState::try_from((self.0 >> STATE_SHIFT) as u16) {
            Ok(state) => state,
            Err(raw) => {
                log::error!("corrupt thread state word {:#010x} (state {})", self.0, raw);
                debug_assert!(false, "corrupt thread state word {:#010x}", self.0);
                ThreadState::Terminated
            },
        }
    }

    #[inline]
    pub fn flags(self) -> u16 {
        (self.0 & FLAGS_MASK) as u16
    }

    #[inline]
    pub fn suspend_requested(self) -> bool {
        self.flags() & SUSPEND_REQUESTED != 0
    }

    #[inline]
    pub fn active_barrier(self) -> bool {
        self.flags() & ACTIVE_BARRIER != 0
    }

    #[inline]
    pub fn with_state(self, state: ThreadState) -> Self {
        Self::pack(state, self.flags())
    }
}

/// The atomic state word
#[derive(Debug)]
pub struct StateWord(AtomicU32);

impl StateWord {
    pub fn new(state: ThreadState) -> Self {
        Self(AtomicU32::new(StateBits::pack(state, 0).raw()))
    }

    #[inline]
    pub fn load(&self) -> StateBits {
        StateBits(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        self.load().state()
    }

    /// Replace `current` with `new` if nothing changed in between
    #[inline]
    pub fn compare_exchange(
        &self,
        current: StateBits,
        new: StateBits,
    ) -> std::result::Result<StateBits, StateBits> {
        self.0
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(StateBits)
            .map_err(StateBits)
    }

    /// Unflagged transition `from -> to`, the mutator fast path
    #[inline]
    pub fn try_fast_transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.compare_exchange(StateBits::pack(from, 0), StateBits::pack(to, 0))
            .is_ok()
    }

    pub fn set_flags(&self, flags: u16) -> StateBits {
        StateBits(self.0.fetch_or(flags as u32, Ordering::AcqRel))
    }

    pub fn clear_flags(&self, flags: u16) -> StateBits {
        StateBits(self.0.fetch_and(!(flags as u32), Ordering::AcqRel))
    }

    /// Unconditional store; only used for `Terminated`
    pub(crate) fn store(&self, bits: StateBits) {
        self.0.store(bits.0, Ordering::Release);
    }
}
