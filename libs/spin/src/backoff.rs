// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::hint;

/// Exponential backoff for the spin loops of the locks in this crate.
///
/// Every call to [`Backoff::spin`] issues `2^exp` spin-loop hints and bumps the exponent
/// until it reaches [`Backoff::MAX_EXPONENT`]. Waiters in a queue lock only ever poll their
/// own predecessor, so the ceiling mostly bounds how late a waiter notices a release.
#[derive(Debug, Copy, Clone)]
pub struct Backoff {
    exp: u8,
}

impl Backoff {
    /// The ceiling for the exponent (2^6 hints per round).
    pub const MAX_EXPONENT: u8 = 6;

    #[must_use]
    pub const fn new() -> Self {
        Self { exp: 0 }
    }

    /// Backs off for one round.
    #[inline(always)]
    pub fn spin(&mut self) {
        for _ in 0..1_u32 << self.exp {
            // Hand the time slice back under test and loom, a hosted "CPU" that spins
            // forever would otherwise starve the thread it is waiting for.
            #[cfg(any(test, loom))]
            crate::loom::thread::yield_now();

            hint::spin_loop();
        }

        self.exp = self.exp.saturating_add(1).min(Self::MAX_EXPONENT);
    }

    #[inline]
    pub fn reset(&mut self) {
        self.exp = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn saturates_at_ceiling() {
        let mut boff = Backoff::new();
        for _ in 0..Backoff::MAX_EXPONENT + 2 {
            boff.spin();
        }
        assert_eq!(boff.exp, Backoff::MAX_EXPONENT);

        boff.reset();
        assert_eq!(boff.exp, 0);
    }
}
