// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

pub mod arm;
pub mod i386;

use core::fmt;

use crate::{PhysicalAddress, VirtualAddress};

/// A two-level 32-bit paging format.
///
/// The top level (the page directory) has [`DIR_ENTRIES`](Self::DIR_ENTRIES) entries that
/// each cover [`WINDOW_SIZE`](Self::WINDOW_SIZE) bytes of linear address space, either by
/// mapping a naturally aligned block of physical memory directly (a big page / section) or
/// by pointing to a page table with [`TABLE_ENTRIES`](Self::TABLE_ENTRIES) entries of
/// [`PAGE_SIZE`](Self::PAGE_SIZE) bytes each. The span of one directory entry is also the
/// size of the temporary windows the kernel maps foreign memory through.
pub trait PagingMode: 'static {
    const NAME: &'static str;
    const PAGE_SIZE: u32;
    const WINDOW_SIZE: u32;
    const DIR_ENTRIES: usize;
    const TABLE_ENTRIES: usize;
    /// Granularity at which the copy primitives report faults. A fault is reported at the
    /// faulting address rounded down to this.
    const COPY_GRANULE: u32;

    type DirEntry: DirectoryEntry;
    type TableEntry: TableEntry;

    /// Index of the directory entry covering `virt`.
    #[inline]
    fn dir_index(virt: VirtualAddress) -> usize {
        (virt.get() / Self::WINDOW_SIZE) as usize
    }

    /// Index of the page table entry covering `virt`, within its directory entry.
    #[inline]
    fn table_index(virt: VirtualAddress) -> usize {
        ((virt.get() % Self::WINDOW_SIZE) / Self::PAGE_SIZE) as usize
    }

    #[inline]
    fn window_offset(virt: VirtualAddress) -> u32 {
        virt.get() % Self::WINDOW_SIZE
    }

    /// First linear address covered by directory entry `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a valid directory index.
    #[inline]
    fn window_base(index: usize) -> VirtualAddress {
        assert!(index < Self::DIR_ENTRIES, "directory index {index} out of range");
        let index = u32::try_from(index).unwrap_or(u32::MAX);
        VirtualAddress::new(index * Self::WINDOW_SIZE)
    }

    /// Byte offset of directory entry `index` within the page directory.
    #[inline]
    fn dir_entry_offset(index: usize) -> u32 {
        debug_assert!(index < Self::DIR_ENTRIES);
        u32::try_from(index * size_of::<u32>()).unwrap_or(u32::MAX)
    }

    /// Byte offset of page table entry `index` within its page table.
    #[inline]
    fn table_entry_offset(index: usize) -> u32 {
        debug_assert!(index < Self::TABLE_ENTRIES);
        u32::try_from(index * size_of::<u32>()).unwrap_or(u32::MAX)
    }
}

/// An entry of the top-level page directory.
pub trait DirectoryEntry: Copy + PartialEq + fmt::Debug {
    const VACANT: Self;

    fn from_raw(raw: u32) -> Self;
    fn raw(self) -> u32;

    /// Maps the naturally aligned block of physical memory containing `phys` through this
    /// entry, accessible from user and kernel mode.
    fn new_big_page(phys: PhysicalAddress, writable: bool) -> Self;
    fn new_table(table: PhysicalAddress) -> Self;

    fn is_present(self) -> bool;
    fn is_big_page(self) -> bool;
    /// Whether the entry permits writes. Always `true` for table entries of formats that
    /// only carry permissions in the page tables.
    fn is_writable(self) -> bool;
    /// The physical block for big pages or the page table otherwise.
    fn address(self) -> PhysicalAddress;
}

/// An entry of a second-level page table.
pub trait TableEntry: Copy + PartialEq + fmt::Debug {
    const VACANT: Self;

    fn from_raw(raw: u32) -> Self;
    fn raw(self) -> u32;

    fn new_page(phys: PhysicalAddress, writable: bool) -> Self;

    fn is_present(self) -> bool;
    fn is_writable(self) -> bool;
    fn address(self) -> PhysicalAddress;
}

/// The hardware a CPU exposes to the memory code.
///
/// One value of this type represents one CPU: the page directory it has loaded, its
/// translation cache and the fault-catching copy primitives that run on it.
pub trait Arch {
    type Mode: PagingMode;

    /// The page directory currently loaded on this CPU.
    fn active_root(&self) -> Option<PhysicalAddress>;

    /// Loads `root` as this CPU's page directory, which also discards all cached
    /// translations.
    ///
    /// # Safety
    ///
    /// `root` must be a well-formed page directory that maps the running kernel.
    unsafe fn set_active_root(&self, root: PhysicalAddress);

    /// Discards this CPU's cached translations so that changes to the loaded page directory
    /// take effect.
    fn reload_translations(&self);

    /// Reads a word through the kernel's own mappings, such as a page directory view.
    ///
    /// # Safety
    ///
    /// `addr` must be mapped, readable and 4-byte aligned.
    #[inline]
    unsafe fn read_word(&self, addr: VirtualAddress) -> u32 {
        // Safety: ensured by caller
        unsafe { addr.as_ptr::<u32>().read_volatile() }
    }

    /// Writes a word through the kernel's own mappings, such as a page directory view.
    ///
    /// # Safety
    ///
    /// `addr` must be mapped, writable and 4-byte aligned, and the write must not break
    /// any mapping the kernel relies on.
    #[inline]
    unsafe fn write_word(&self, addr: VirtualAddress, value: u32) {
        // Safety: ensured by caller
        unsafe { addr.as_mut_ptr::<u32>().write_volatile(value) }
    }

    /// Copies `len` bytes from `src` to `dst`, both linear addresses in the loaded address
    /// space. A page fault aborts the copy and returns the faulting address rounded down to
    /// [`PagingMode::COPY_GRANULE`]; bytes before it may or may not have been copied.
    ///
    /// # Safety
    ///
    /// The ranges must not alias memory the kernel holds references to.
    unsafe fn copy_catch(
        &self,
        src: VirtualAddress,
        dst: VirtualAddress,
        len: u32,
    ) -> Result<(), VirtualAddress>;

    /// Like [`copy_catch`](Self::copy_catch), copying into kernel memory.
    ///
    /// # Safety
    ///
    /// See [`copy_catch`](Self::copy_catch).
    unsafe fn read_catch(&self, src: VirtualAddress, buf: &mut [u8]) -> Result<(), VirtualAddress>;

    /// Fills `len` bytes at `dst` with the 4-byte `pattern`, reporting faults like
    /// [`copy_catch`](Self::copy_catch).
    ///
    /// # Safety
    ///
    /// See [`copy_catch`](Self::copy_catch).
    unsafe fn fill_catch(
        &self,
        dst: VirtualAddress,
        pattern: u32,
        len: u32,
    ) -> Result<(), VirtualAddress>;
}
