//! Concurrent Mark State - Per-Thread Interrupt Word
//!
//! Each mutator carries one 64-bit interrupt word. Generated code answers
//! "do I need a marking barrier" with a single acquire load and a mask:
//!
//! ```text
//! ┌──────────────────────────┬──────┬──────┬────────┬──────────────┐
//! │  Reserved (63-5)         │ TERM │ VMSP │ SHARED │ LOCAL (1-0)  │
//! │                          │  4   │  3   │   2    │              │
//! └──────────────────────────┴──────┴──────┴────────┴──────────────┘
//! LOCAL:  0 ReadyToMark, 1 Marking, 2 MarkFinished
//! SHARED: 0 ReadyToMark, 1 ConcurrentMarkingOrFinished
//! VMSP:   a VM-wide suspension is pending
//! TERM:   termination requested
//! ```
//!
//! The local and shared fields are written independently by the collector
//! (`Release`) and must never be folded into one check.

use std::sync::atomic::{AtomicU64, Ordering};

pub const LOCAL_MARK_MASK: u64 = 0b11;
pub const SHARED_MARK_BIT: u64 = 1 << 2;
pub const VM_SUSPENSION_BIT: u64 = 1 << 3;
pub const TERMINATION_BIT: u64 = 1 << 4;

/// Local heap concurrent-mark status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LocalMarkStatus {
    /// No marking in progress, barriers skip the marking trigger
    ReadyToMark = 0,
    /// Concurrent marking, barriers must fire the marking trigger
    Marking = 1,
    /// Mark phase complete, only sweep remains
    MarkFinished = 2,
}

impl LocalMarkStatus {
    fn from_bits(bits: u64) -> Self {
        match bits & LOCAL_MARK_MASK {
            1 => LocalMarkStatus::Marking,
            2 => LocalMarkStatus::MarkFinished,
            _ => LocalMarkStatus::ReadyToMark,
        }
    }
}

/// Shared heap concurrent-mark status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SharedMarkStatus {
    ReadyToMark = 0,
    ConcurrentMarkingOrFinished = 1,
}

/// One acquire-loaded copy of the interrupt word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptBits(u64);

impl InterruptBits {
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn local_mark(self) -> LocalMarkStatus {
        LocalMarkStatus::from_bits(self.0)
    }

    #[inline]
    pub fn shared_mark(self) -> SharedMarkStatus {
        if self.0 & SHARED_MARK_BIT != 0 {
            SharedMarkStatus::ConcurrentMarkingOrFinished
        } else {
            SharedMarkStatus::ReadyToMark
        }
    }

    /// Local marking trigger must fire
    #[inline(always)]
    pub fn is_local_marking(self) -> bool {
        self.0 & LOCAL_MARK_MASK == LocalMarkStatus::Marking as u64
    }

    /// Shared marking trigger must fire
    #[inline(always)]
    pub fn is_shared_marking(self) -> bool {
        self.0 & SHARED_MARK_BIT != 0
    }

    /// Either trigger may fire; gates the batch HandleMark pass
    #[inline(always)]
    pub fn any_marking(self) -> bool {
        self.is_local_marking() || self.is_shared_marking()
    }

    #[inline]
    pub fn vm_suspension_pending(self) -> bool {
        self.0 & VM_SUSPENSION_BIT != 0
    }

    #[inline]
    pub fn termination_requested(self) -> bool {
        self.0 & TERMINATION_BIT != 0
    }
}

/// The per-thread atomic interrupt word
#[derive(Debug, Default)]
pub struct InterruptWord(AtomicU64);

impl InterruptWord {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline(always)]
    pub fn load(&self) -> InterruptBits {
        InterruptBits(self.0.load(Ordering::Acquire))
    }

    /// Replace the local mark field, leaving every other bit alone
    pub fn set_local_mark(&self, status: LocalMarkStatus) -> LocalMarkStatus {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let new = (current & !LOCAL_MARK_MASK) | status as u64;
            match self
                .0
                .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(previous) => return LocalMarkStatus::from_bits(previous),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn set_shared_mark(&self, status: SharedMarkStatus) -> SharedMarkStatus {
        let previous = match status {
            SharedMarkStatus::ConcurrentMarkingOrFinished => {
                self.0.fetch_or(SHARED_MARK_BIT, Ordering::AcqRel)
            }
            SharedMarkStatus::ReadyToMark => self.0.fetch_and(!SHARED_MARK_BIT, Ordering::AcqRel),
        };
        InterruptBits(previous).shared_mark()
    }

    pub fn set_flag(&self, bit: u64) {
        self.0.fetch_or(bit, Ordering::AcqRel);
    }

    pub fn clear_flag(&self, bit: u64) {
        self.0.fetch_and(!bit, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_ready() {
        let word = InterruptWord::new();
        let bits = word.load();
        assert_eq!(bits.local_mark(), LocalMarkStatus::ReadyToMark);
        assert_eq!(bits.shared_mark(), SharedMarkStatus::ReadyToMark);
        assert!(!bits.any_marking());
    }

    #[test]
    fn test_fields_are_independent() {
        let word = InterruptWord::new();
        word.set_shared_mark(SharedMarkStatus::ConcurrentMarkingOrFinished);
        word.set_local_mark(LocalMarkStatus::Marking);
        word.set_flag(TERMINATION_BIT);

        let bits = word.load();
        assert!(bits.is_local_marking());
        assert!(bits.is_shared_marking());
        assert!(bits.termination_requested());

        word.set_local_mark(LocalMarkStatus::MarkFinished);
        let bits = word.load();
        assert!(!bits.is_local_marking());
        assert_eq!(bits.local_mark(), LocalMarkStatus::MarkFinished);
        assert!(bits.is_shared_marking(), "shared field must be untouched");

        word.set_shared_mark(SharedMarkStatus::ReadyToMark);
        let bits = word.load();
        assert!(!bits.is_shared_marking());
        assert_eq!(bits.local_mark(), LocalMarkStatus::MarkFinished);
        assert!(bits.termination_requested());
    }

    #[test]
    fn test_set_returns_previous() {
        let word = InterruptWord::new();
        assert_eq!(
            word.set_local_mark(LocalMarkStatus::Marking),
            LocalMarkStatus::ReadyToMark
        );
        assert_eq!(
            word.set_local_mark(LocalMarkStatus::ReadyToMark),
            LocalMarkStatus::Marking
        );
    }
}
