// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arch::{DirectoryEntry, PagingMode, TableEntry};
use crate::test_utils::Machine;
use crate::{PhysicalAddress, VirtualAddress};

/// Granularity of [`Frames`] allocations, the small page size of both paging modes.
pub const FRAME_SIZE: u32 = 4096;

/// A bump allocator handing out zeroed physical memory. Nothing is ever freed.
pub struct Frames {
    next: Mutex<PhysicalAddress>,
    end: PhysicalAddress,
}

impl Frames {
    pub fn new(range: Range<PhysicalAddress>) -> Arc<Self> {
        Arc::new(Self {
            next: Mutex::new(range.start),
            end: range.end,
        })
    }

    /// Allocates `len` bytes, rounded up to whole frames.
    ///
    /// # Panics
    ///
    /// Panics if there is not enough memory left.
    pub fn alloc(&self, len: u32) -> PhysicalAddress {
        self.alloc_aligned(len, FRAME_SIZE)
    }

    /// # Panics
    ///
    /// Panics if there is not enough memory left.
    pub fn alloc_aligned(&self, len: u32, align: u32) -> PhysicalAddress {
        let align = align.max(FRAME_SIZE);
        let mut next = self.next.lock();

        let start = next.checked_align_up(align);
        let end = start.and_then(|start| start.checked_add(len.next_multiple_of(FRAME_SIZE)));
        match (start, end) {
            (Some(start), Some(end)) if end <= self.end => {
                *next = end;
                start
            }
            _ => panic!("out of frames allocating {len:#x} bytes ({self:?})"),
        }
    }
}

impl fmt::Debug for Frames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frames")
            .field("next", &*self.next.lock())
            .field("end", &self.end)
            .finish()
    }
}

/// A page directory built directly in the memory of an emulated [`Machine`], playing the part
/// of the VM server.
pub struct AddressSpace<M> {
    machine: Machine<M>,
    frames: Arc<Frames>,
    root: PhysicalAddress,
}

impl<M: PagingMode> AddressSpace<M> {
    pub fn new(machine: &Machine<M>, frames: &Arc<Frames>) -> Self {
        let size = dir_bytes::<M>();
        let root = frames.alloc_aligned(size, size);
        machine.write_phys(root, &vec![0; size as usize]);

        Self {
            machine: machine.clone(),
            frames: Arc::clone(frames),
            root,
        }
    }

    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    pub fn dir_entry(&self, virt: VirtualAddress) -> M::DirEntry {
        M::DirEntry::from_raw(self.machine.read_phys_u32(self.dir_entry_addr(virt)))
    }

    /// Maps `len` bytes at `virt` to the physically contiguous range at `phys` with small
    /// pages, allocating page tables as needed.
    ///
    /// # Panics
    ///
    /// Panics if the range overlaps a big page.
    pub fn map(&self, virt: VirtualAddress, phys: PhysicalAddress, len: u32, writable: bool) {
        debug_assert!(virt.is_aligned_to(M::PAGE_SIZE) && phys.is_aligned_to(M::PAGE_SIZE));
        for offset in (0..len).step_by(M::PAGE_SIZE as usize) {
            let page = virt.add(offset);
            let pte = M::TableEntry::new_page(phys.add(offset), writable);
            self.machine.write_phys_u32(self.table_entry_addr(page, true), pte.raw());
        }
    }

    /// Removes the small page mappings of `len` bytes at `virt`.
    ///
    /// # Panics
    ///
    /// Panics if a page of the range has no page table.
    pub fn unmap(&self, virt: VirtualAddress, len: u32) {
        for offset in (0..len).step_by(M::PAGE_SIZE as usize) {
            let entry = self.table_entry_addr(virt.add(offset), false);
            self.machine
                .write_phys_u32(entry, M::TableEntry::VACANT.raw());
        }
    }

    /// Maps the window-sized block at `virt` with a single directory entry.
    pub fn map_big(&self, virt: VirtualAddress, phys: PhysicalAddress, writable: bool) {
        debug_assert!(virt.is_aligned_to(M::WINDOW_SIZE) && phys.is_aligned_to(M::WINDOW_SIZE));
        let pde = M::DirEntry::new_big_page(phys, writable);
        self.machine
            .write_phys_u32(self.dir_entry_addr(virt), pde.raw());
    }

    /// Maps `range` of physical memory one-to-one with big pages.
    pub fn map_identity(&self, range: Range<PhysicalAddress>) {
        let mut phys = range.start.align_down(M::WINDOW_SIZE);
        while phys < range.end {
            self.map_big(phys.identity(), phys, true);
            match phys.checked_add(M::WINDOW_SIZE) {
                Some(next) => phys = next,
                None => break,
            }
        }
    }

    fn dir_entry_addr(&self, virt: VirtualAddress) -> PhysicalAddress {
        self.root.add(M::dir_entry_offset(M::dir_index(virt)))
    }

    fn table_entry_addr(&self, virt: VirtualAddress, create: bool) -> PhysicalAddress {
        let pde = self.dir_entry(virt);
        let table = if pde.is_present() {
            assert!(!pde.is_big_page(), "{virt} is mapped by a big page");
            pde.address()
        } else {
            assert!(create, "{virt} has no page table");
            let size = table_bytes::<M>();
            let table = self.frames.alloc_aligned(size, size);
            self.machine.write_phys(table, &vec![0; size as usize]);
            self.machine
                .write_phys_u32(self.dir_entry_addr(virt), M::DirEntry::new_table(table).raw());
            table
        };

        table.add(M::table_entry_offset(M::table_index(virt)))
    }
}

impl<M: PagingMode> fmt::Debug for AddressSpace<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

fn dir_bytes<M: PagingMode>() -> u32 {
    u32::try_from(M::DIR_ENTRIES * size_of::<u32>()).unwrap_or(u32::MAX)
}

fn table_bytes<M: PagingMode>() -> u32 {
    u32::try_from(M::TABLE_ENTRIES * size_of::<u32>()).unwrap_or(u32::MAX)
}
