//! Spin-then-yield backoff policy.
//!
//! Bounded busy-wait loops share one retry discipline: spin with
//! `std::hint::spin_loop()` for a fixed number of rounds, then yield the
//! thread. The state lives in the policy object so the progression is
//! testable.

/// Number of spin rounds before the policy starts yielding.
const SPIN_LIMIT: u32 = 64;

#[derive(Debug)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    #[inline]
    pub fn new() -> Self {
        Backoff { step: 0 }
    }

    /// Whether the next `wait` will yield instead of spin.
    #[inline]
    pub fn is_yielding(&self) -> bool {
        self.step >= SPIN_LIMIT
    }

    /// Wait one round. Spins for the first [`SPIN_LIMIT`] rounds, with the
    /// spin count doubling each round, then yields the thread.
    #[inline]
    pub fn wait(&mut self) {
        if self.step < SPIN_LIMIT {
            for _ in 0..(1u32 << (self.step / 8).min(6)) {
                std::hint::spin_loop();
            }
            self.step += 1;
        } else {
            std::thread::yield_now();
        }
    }

    /// Reset after progress was made.
    #[inline]
    pub fn reset(&mut self) {
        self.step = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_to_yield() {
        let mut b = Backoff::new();
        assert!(!b.is_yielding());
        for _ in 0..SPIN_LIMIT {
            b.wait();
        }
        assert!(b.is_yielding());
        b.wait();
        assert!(b.is_yielding());
    }

    #[test]
    fn test_reset_returns_to_spinning() {
        let mut b = Backoff::new();
        for _ in 0..SPIN_LIMIT {
            b.wait();
        }
        b.reset();
        assert!(!b.is_yielding());
    }
}
