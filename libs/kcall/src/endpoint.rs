// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use kmem::ProcNr;

const GENERATION_SHIFT: u32 = 15;
const GENERATION_SIZE: i32 = 1 << GENERATION_SHIFT;
/// Slack below slot zero so kernel tasks (negative slots) still decode to generation zero.
const MAX_NR_TASKS: i32 = 1023;
const MAX_GENERATION: i32 = i32::MAX / GENERATION_SIZE - 1;

/// Names a process in kernel call arguments.
///
/// An endpoint combines the process table slot with a generation that is bumped every time
/// the slot is reused, so an endpoint kept around after its process exited does not
/// silently refer to the next process in that slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(i32);

impl Endpoint {
    /// No process. In copy arguments it means physical memory.
    pub const NONE: Self = Self(0x6ace);
    pub const ANY: Self = Self(0x7ace);
    /// The calling process.
    pub const SELF: Self = Self(0x8ace);

    pub const KERNEL: Self = Self::new(0, ProcNr(-1));
    pub const SYSTEM: Self = Self::new(0, ProcNr(-2));

    #[must_use]
    pub const fn new(generation: i32, nr: ProcNr) -> Self {
        Self((generation << GENERATION_SHIFT) + nr.0)
    }

    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// The process table slot this endpoint refers to.
    #[must_use]
    pub const fn proc_nr(self) -> ProcNr {
        ProcNr((self.0.wrapping_add(MAX_NR_TASKS) & (GENERATION_SIZE - 1)) - MAX_NR_TASKS)
    }

    #[must_use]
    pub const fn generation(self) -> i32 {
        self.0.wrapping_add(MAX_NR_TASKS) >> GENERATION_SHIFT
    }

    /// The endpoint of the next process to occupy this slot.
    #[must_use]
    pub const fn next_generation(self) -> Self {
        let mut generation = self.generation() + 1;
        if generation >= MAX_GENERATION {
            generation = 1;
        }
        Self::new(generation, self.proc_nr())
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => f.write_str("Endpoint(NONE)"),
            Self::ANY => f.write_str("Endpoint(ANY)"),
            Self::SELF => f.write_str("Endpoint(SELF)"),
            _ => f
                .debug_struct("Endpoint")
                .field("nr", &self.proc_nr())
                .field("generation", &self.generation())
                .finish(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::config::{NR_PROCS, NR_TASKS};

    #[test]
    fn kernel_tasks_are_generation_zero() {
        assert_eq!(Endpoint::SYSTEM.raw(), -2);
        assert_eq!(Endpoint::SYSTEM.proc_nr(), ProcNr(-2));
        assert_eq!(Endpoint::SYSTEM.generation(), 0);
        assert_eq!(Endpoint::KERNEL.proc_nr(), ProcNr(-1));
    }

    #[test]
    fn decodes_slot_and_generation() {
        let e = Endpoint::new(3, ProcNr(17));
        assert_eq!(e.raw(), 3 * 32768 + 17);
        assert_eq!(e.proc_nr(), ProcNr(17));
        assert_eq!(e.generation(), 3);

        let next = e.next_generation();
        assert_eq!(next.proc_nr(), ProcNr(17));
        assert_eq!(next.generation(), 4);
    }

    #[test]
    fn generations_wrap_to_one() {
        let last = Endpoint::new(MAX_GENERATION - 1, ProcNr(2));
        assert_eq!(last.next_generation(), Endpoint::new(1, ProcNr(2)));
    }

    #[test]
    fn special_endpoints_are_outside_the_table() {
        for e in [Endpoint::NONE, Endpoint::ANY, Endpoint::SELF] {
            assert!(e.proc_nr().0 > 1000, "{e:?}");
        }
    }

    proptest! {
        #[test]
        fn every_slot_decodes(generation in 0..MAX_GENERATION, nr in -NR_TASKS..NR_PROCS) {
            let e = Endpoint::new(generation, ProcNr(nr));
            prop_assert_eq!(e.proc_nr(), ProcNr(nr));
            prop_assert_eq!(e.generation(), generation);

            let next = e.next_generation();
            prop_assert_eq!(next.proc_nr(), ProcNr(nr));
            prop_assert_ne!(next, e);
        }
    }
}
