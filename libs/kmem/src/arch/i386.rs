// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Classic two-level i386 paging with 4 MiB pages (CR4.PSE).

use crate::PhysicalAddress;
use crate::arch::{DirectoryEntry, PagingMode, TableEntry};

const FRAME_SHIFT: u32 = 12;
const BIG_PAGE_MASK: u32 = !(I386::WINDOW_SIZE - 1);

pub struct I386;

impl PagingMode for I386 {
    const NAME: &'static str = "i386";
    const PAGE_SIZE: u32 = 4096;
    const WINDOW_SIZE: u32 = 4 * 1024 * 1024;
    const DIR_ENTRIES: usize = 1024;
    const TABLE_ENTRIES: usize = 1024;
    // `rep movsb` faults exactly at the byte it could not access
    const COPY_GRANULE: u32 = 1;

    type DirEntry = PageDirEntry;
    type TableEntry = PageTableEntry;
}

mycelium_bitfield::bitfield! {
    /// Page directory entry.
    #[derive(PartialEq, Eq)]
    pub struct PageDirEntry<u32> {
        const PRESENT: bool;
        const WRITE: bool;
        const USER: bool;
        const WRITE_THROUGH: bool;
        const NO_CACHE: bool;
        const ACCESSED: bool;
        const DIRTY: bool;
        /// Maps a 4 MiB page instead of pointing to a page table.
        const BIG_PAGE: bool;
        const GLOBAL: bool;
        /// Available for use by the kernel.
        const AVAIL = 3;
        /// Page table frame; for big pages only the top ten bits are the frame.
        const FRAME = 20;
    }
}

mycelium_bitfield::bitfield! {
    /// Page table entry.
    #[derive(PartialEq, Eq)]
    pub struct PageTableEntry<u32> {
        const PRESENT: bool;
        const WRITE: bool;
        const USER: bool;
        const WRITE_THROUGH: bool;
        const NO_CACHE: bool;
        const ACCESSED: bool;
        const DIRTY: bool;
        const PAT: bool;
        const GLOBAL: bool;
        const AVAIL = 3;
        const FRAME = 20;
    }
}

impl DirectoryEntry for PageDirEntry {
    const VACANT: Self = Self::new();

    fn from_raw(raw: u32) -> Self {
        Self::from_bits(raw)
    }

    fn raw(self) -> u32 {
        self.bits()
    }

    fn new_big_page(phys: PhysicalAddress, writable: bool) -> Self {
        Self::new()
            .with(Self::PRESENT, true)
            .with(Self::WRITE, writable)
            .with(Self::USER, true)
            .with(Self::BIG_PAGE, true)
            .with(Self::FRAME, (phys.get() & BIG_PAGE_MASK) >> FRAME_SHIFT)
    }

    fn new_table(table: PhysicalAddress) -> Self {
        debug_assert!(table.is_aligned_to(I386::PAGE_SIZE));
        Self::new()
            .with(Self::PRESENT, true)
            .with(Self::WRITE, true)
            .with(Self::USER, true)
            .with(Self::FRAME, table.get() >> FRAME_SHIFT)
    }

    fn is_present(self) -> bool {
        self.get(Self::PRESENT)
    }

    fn is_big_page(self) -> bool {
        self.get(Self::BIG_PAGE)
    }

    fn is_writable(self) -> bool {
        self.get(Self::WRITE)
    }

    fn address(self) -> PhysicalAddress {
        let frame = self.get(Self::FRAME) << FRAME_SHIFT;
        if self.is_big_page() {
            PhysicalAddress::new(frame & BIG_PAGE_MASK)
        } else {
            PhysicalAddress::new(frame)
        }
    }
}

impl TableEntry for PageTableEntry {
    const VACANT: Self = Self::new();

    fn from_raw(raw: u32) -> Self {
        Self::from_bits(raw)
    }

    fn raw(self) -> u32 {
        self.bits()
    }

    fn new_page(phys: PhysicalAddress, writable: bool) -> Self {
        debug_assert!(phys.is_aligned_to(I386::PAGE_SIZE));
        Self::new()
            .with(Self::PRESENT, true)
            .with(Self::WRITE, writable)
            .with(Self::USER, true)
            .with(Self::FRAME, phys.get() >> FRAME_SHIFT)
    }

    fn is_present(self) -> bool {
        self.get(Self::PRESENT)
    }

    fn is_writable(self) -> bool {
        self.get(Self::WRITE)
    }

    fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.get(Self::FRAME) << FRAME_SHIFT)
    }
}

#[cfg(target_arch = "x86")]
pub use hw::I386Cpu;

#[cfg(target_arch = "x86")]
mod hw {
    use core::arch::asm;

    use super::I386;
    use crate::arch::Arch;
    use crate::{PhysicalAddress, VirtualAddress};

    unsafe extern "C" {
        /// Fault-catching `rep movsb`, returns the faulting address or zero.
        fn phys_copy_catch(src: u32, dst: u32, len: u32) -> u32;
        /// Fault-catching `rep stosl`, returns the faulting address or zero.
        fn phys_memset_catch(dst: u32, pattern: u32, len: u32) -> u32;
    }

    fn caught(addr: u32) -> Result<(), VirtualAddress> {
        match addr {
            0 => Ok(()),
            addr => Err(VirtualAddress::new(addr)),
        }
    }

    /// The CPU the code is running on.
    #[derive(Debug, Default)]
    pub struct I386Cpu;

    impl Arch for I386Cpu {
        type Mode = I386;

        fn active_root(&self) -> Option<PhysicalAddress> {
            let cr3: u32;
            // Safety: reading cr3 has no side effects
            unsafe { asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags)) };
            (cr3 != 0).then_some(PhysicalAddress::new(cr3 & !0xfff))
        }

        unsafe fn set_active_root(&self, root: PhysicalAddress) {
            // Safety: ensured by caller
            unsafe { asm!("mov cr3, {}", in(reg) root.get(), options(nostack, preserves_flags)) };
        }

        fn reload_translations(&self) {
            if let Some(root) = self.active_root() {
                // Safety: writing back the loaded directory only flushes the TLB
                unsafe { self.set_active_root(root) };
            }
        }

        unsafe fn copy_catch(
            &self,
            src: VirtualAddress,
            dst: VirtualAddress,
            len: u32,
        ) -> Result<(), VirtualAddress> {
            // Safety: ensured by caller
            caught(unsafe { phys_copy_catch(src.get(), dst.get(), len) })
        }

        unsafe fn read_catch(
            &self,
            src: VirtualAddress,
            buf: &mut [u8],
        ) -> Result<(), VirtualAddress> {
            let dst = VirtualAddress::new(buf.as_mut_ptr().expose_provenance() as u32);
            let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
            // Safety: ensured by caller, `buf` is valid for `len` bytes of writes
            caught(unsafe { phys_copy_catch(src.get(), dst.get(), len) })
        }

        unsafe fn fill_catch(
            &self,
            dst: VirtualAddress,
            pattern: u32,
            len: u32,
        ) -> Result<(), VirtualAddress> {
            // Safety: ensured by caller
            caught(unsafe { phys_memset_catch(dst.get(), pattern, len) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VirtualAddress;

    #[test]
    fn big_page_entry() {
        let pde = PageDirEntry::new_big_page(PhysicalAddress::new(0x0123_4567), true);
        assert!(pde.is_present());
        assert!(pde.is_big_page());
        assert!(pde.is_writable());
        assert_eq!(pde.address(), PhysicalAddress::new(0x0100_0000));
        // PRESENT | WRITE | USER | BIG_PAGE
        assert_eq!(pde.raw() & 0xfff, 0x87);
    }

    #[test]
    fn table_entries() {
        let pde = PageDirEntry::new_table(PhysicalAddress::new(0x0020_3000));
        assert!(!pde.is_big_page());
        assert_eq!(pde.address(), PhysicalAddress::new(0x0020_3000));

        let pte = PageTableEntry::new_page(PhysicalAddress::new(0x0040_5000), false);
        assert!(pte.is_present());
        assert!(!pte.is_writable());
        assert_eq!(pte.address(), PhysicalAddress::new(0x0040_5000));
        assert_eq!(PageTableEntry::from_raw(pte.raw()), pte);
        assert!(!PageTableEntry::VACANT.is_present());
    }

    #[test]
    fn indices() {
        let virt = VirtualAddress::new(0x8040_3123);
        assert_eq!(I386::dir_index(virt), 0x201);
        assert_eq!(I386::table_index(virt), 3);
        assert_eq!(I386::window_offset(virt), 0x3123);
        assert_eq!(I386::window_base(0x201), VirtualAddress::new(0x8040_0000));
    }
}
