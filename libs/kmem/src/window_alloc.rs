// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::marker::PhantomData;

use arrayvec::ArrayVec;

use crate::VirtualAddress;
use crate::arch::PagingMode;

/// Number of page directory entries reserved for temporary windows.
pub const MAX_FREE_PDES: usize = 2;

/// One of the reserved window slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSlot(usize);

impl WindowSlot {
    /// The slot the source of a copy is mapped through.
    pub const SOURCE: Self = Self(0);
    /// The slot the destination of a copy (or fill) is mapped through.
    pub const DESTINATION: Self = Self(1);

    #[must_use]
    pub const fn new(n: usize) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

/// Page directory entries the VM server left free in every address space, so the kernel can
/// temporarily point them at foreign memory.
///
/// Reserved once at boot and read-only afterwards.
pub struct WindowSlots<M> {
    indices: ArrayVec<usize, MAX_FREE_PDES>,
    _mode: PhantomData<M>,
}

impl<M: PagingMode> WindowSlots<M> {
    /// Reserves [`MAX_FREE_PDES`] consecutive directory entries starting at `*freepde_start`
    /// and advances `*freepde_start` past them, so whoever allocates directory entries next
    /// (the VM server) sees them as taken.
    ///
    /// # Panics
    ///
    /// Panics if a reserved index does not exist in the page directory.
    pub fn reserve(freepde_start: &mut usize) -> Self {
        let mut indices = ArrayVec::new();
        for _ in 0..MAX_FREE_PDES {
            let index = *freepde_start;
            assert!(
                index < M::DIR_ENTRIES,
                "window slot {index} outside of the {} entry page directory",
                M::DIR_ENTRIES
            );
            indices.push(index);
            *freepde_start += 1;
        }

        log::debug!("{}: reserved window slots {:?}", M::NAME, indices.as_slice());

        Self {
            indices,
            _mode: PhantomData,
        }
    }

    /// Directory index of `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is not one of the reserved slots.
    pub fn dir_index(&self, slot: WindowSlot) -> usize {
        match self.indices.get(slot.0) {
            Some(index) => *index,
            None => panic!("no window slot #{}", slot.0),
        }
    }

    /// First linear address of the window behind `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is not one of the reserved slots.
    pub fn base(&self, slot: WindowSlot) -> VirtualAddress {
        M::window_base(self.dir_index(slot))
    }

    /// Directory indices of all slots.
    pub fn dir_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.indices.iter().copied()
    }
}

impl<M> fmt::Debug for WindowSlots<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowSlots")
            .field("indices", &self.indices.as_slice())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::arm::ArmV7;
    use crate::arch::i386::I386;

    #[test]
    fn reserves_consecutive_entries() {
        let mut next = 1000;
        let slots = WindowSlots::<I386>::reserve(&mut next);

        assert_eq!(next, 1002);
        assert_eq!(slots.dir_index(WindowSlot::SOURCE), 1000);
        assert_eq!(slots.dir_index(WindowSlot::DESTINATION), 1001);
        assert_eq!(slots.base(WindowSlot::DESTINATION), VirtualAddress::new(1001 << 22));
        assert_eq!(slots.dir_indices().collect::<Vec<_>>(), [1000, 1001]);
    }

    #[test]
    fn arm_windows_are_sections() {
        let mut next = 4094;
        let slots = WindowSlots::<ArmV7>::reserve(&mut next);
        assert_eq!(slots.base(WindowSlot::SOURCE), VirtualAddress::new(0xffe0_0000));
    }

    #[test]
    #[should_panic(expected = "outside of the 1024 entry page directory")]
    fn rejects_slots_past_the_directory() {
        let mut next = 1023;
        let _ = WindowSlots::<I386>::reserve(&mut next);
    }

    #[test]
    #[should_panic(expected = "no window slot #2")]
    fn unknown_slot() {
        let mut next = 10;
        let slots = WindowSlots::<I386>::reserve(&mut next);
        let _ = slots.dir_index(WindowSlot::new(2));
    }
}
