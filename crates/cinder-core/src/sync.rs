//! # Spin Helpers
//!
//! Bounded spinning with exponential backoff.
//!
//! Completion waits and the device-side dispatch critical section are
//! short holds, so callers spin instead of parking. [`Backoff`] doubles the
//! number of `spin_loop` hints per round up to a cap; past the cap it yields
//! the time slice when `std` is linked.

use core::sync::atomic::{AtomicU32, Ordering};

/// Rounds of doubling before the spin count stops growing
const SPIN_LIMIT: u32 = 6;

/// Rounds after which a waiter yields (when a scheduler is available)
const YIELD_LIMIT: u32 = 10;

// =============================================================================
// BACKOFF
// =============================================================================

/// Exponential backoff for spin waits
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    /// Create a fresh backoff
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    /// Reset to the shortest wait
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Wait one round
    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                core::hint::spin_loop();
            }
        } else {
            Self::yield_now();
        }

        if self.step <= YIELD_LIMIT {
            self.step += 1;
        }
    }

    /// Check if the backoff has moved past pure spinning
    pub fn is_yielding(&self) -> bool {
        self.step > SPIN_LIMIT
    }

    #[cfg(any(test, feature = "std"))]
    fn yield_now() {
        std::thread::yield_now();
    }

    #[cfg(not(any(test, feature = "std")))]
    fn yield_now() {
        for _ in 0..(1u32 << SPIN_LIMIT) {
            core::hint::spin_loop();
        }
    }
}

/// Spin until `done` returns true
pub fn spin_until(mut done: impl FnMut() -> bool) {
    let mut backoff = Backoff::new();
    while !done() {
        backoff.snooze();
    }
}

// =============================================================================
// COMPLETION TAG
// =============================================================================

/// Device-written progress counter
///
/// The engine stores the last completed task count here; host threads only
/// read it.
#[derive(Debug)]
pub struct CompletionTag {
    value: AtomicU32,
}

impl CompletionTag {
    /// Create a tag holding `initial`
    pub const fn new(initial: u32) -> Self {
        Self {
            value: AtomicU32::new(initial),
        }
    }

    /// Current value
    pub fn load(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    /// Advance to `value`; never moves backwards
    pub fn signal(&self, value: u32) {
        self.value.fetch_max(value, Ordering::AcqRel);
    }

    /// Check if `value` has been reached
    pub fn is_reached(&self, value: u32) -> bool {
        self.load() >= value
    }

    /// Spin until `value` has been reached
    pub fn wait(&self, value: u32) {
        spin_until(|| self.is_reached(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use std::thread;

    #[test]
    fn test_backoff_escalates() {
        let mut backoff = Backoff::new();
        for _ in 0..=SPIN_LIMIT {
            assert!(!backoff.is_yielding());
            backoff.snooze();
        }
        assert!(backoff.is_yielding());
        backoff.reset();
        assert!(!backoff.is_yielding());
    }

    #[test]
    fn test_tag_never_moves_backwards() {
        let tag = CompletionTag::new(0);
        tag.signal(5);
        tag.signal(3);
        assert_eq!(tag.load(), 5);
        assert!(tag.is_reached(4));
        assert!(!tag.is_reached(6));
    }

    #[test]
    fn test_wait_across_threads() {
        let tag = Arc::new(CompletionTag::new(0));
        let writer = {
            let tag = Arc::clone(&tag);
            thread::spawn(move || {
                for v in 1..=100 {
                    tag.signal(v);
                }
            })
        };
        tag.wait(100);
        writer.join().unwrap();
        assert_eq!(tag.load(), 100);
    }
}
