// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! ARMv7-A short-descriptor translation tables.
//!
//! The first level has 4096 entries of 1 MiB each, mapping either a section or a coarse
//! second-level table of 256 small (4 KiB) pages. Access permissions live in the leaf
//! descriptors only.

use crate::PhysicalAddress;
use crate::arch::{DirectoryEntry, PagingMode, TableEntry};

const SECTION_SHIFT: u32 = 20;
const FRAME_SHIFT: u32 = 12;
const COARSE_TABLE_MASK: u32 = !0x3ff;

// first-level descriptor types, bits [1:0]
const KIND_FAULT: u32 = 0b00;
const KIND_COARSE: u32 = 0b01;
const KIND_SECTION: u32 = 0b10;

// AP[1:0] with AP[2] clear
const AP_KERNEL_RW: u32 = 0b01;
const AP_USER_RO: u32 = 0b10;
const AP_FULL: u32 = 0b11;

// TEX/C/B for normal write-back memory
const TEX_WRITE_BACK: u32 = 0b001;

/// The domain every mapping of the kernel uses.
const KERNEL_DOMAIN: u32 = 0;

pub struct ArmV7;

impl PagingMode for ArmV7 {
    const NAME: &'static str = "armv7";
    const PAGE_SIZE: u32 = 4096;
    const WINDOW_SIZE: u32 = 1024 * 1024;
    const DIR_ENTRIES: usize = 4096;
    const TABLE_ENTRIES: usize = 256;
    // the copy routines move whole words and report the word that faulted
    const COPY_GRANULE: u32 = 4;

    type DirEntry = L1Descriptor;
    type TableEntry = L2Descriptor;
}

mycelium_bitfield::bitfield! {
    /// First-level descriptor. The layout below is the section layout, coarse table
    /// descriptors only share `KIND` and `DOMAIN` and keep their base in bits `[31:10]`.
    #[derive(PartialEq, Eq)]
    pub struct L1Descriptor<u32> {
        const KIND = 2;
        const BUFFERABLE: bool;
        const CACHEABLE: bool;
        const EXECUTE_NEVER: bool;
        const DOMAIN = 4;
        const IMPL: bool;
        const AP = 2;
        const TEX = 3;
        /// Clears write permission for all access levels.
        const AP2: bool;
        const SHAREABLE: bool;
        const NOT_GLOBAL: bool;
        const SUPERSECTION: bool;
        const NON_SECURE: bool;
        const SECTION_BASE = 12;
    }
}

mycelium_bitfield::bitfield! {
    /// Second-level small page descriptor.
    #[derive(PartialEq, Eq)]
    pub struct L2Descriptor<u32> {
        const EXECUTE_NEVER: bool;
        /// Set for small pages, the only second-level format used.
        const SMALL_PAGE: bool;
        const BUFFERABLE: bool;
        const CACHEABLE: bool;
        const AP = 2;
        const TEX = 3;
        const AP2: bool;
        const SHAREABLE: bool;
        const NOT_GLOBAL: bool;
        const FRAME = 20;
    }
}

impl L1Descriptor {
    fn is_section(self) -> bool {
        self.get(Self::KIND) == KIND_SECTION && !self.get(Self::SUPERSECTION)
    }

    fn is_coarse_table(self) -> bool {
        self.get(Self::KIND) == KIND_COARSE
    }
}

impl DirectoryEntry for L1Descriptor {
    const VACANT: Self = Self::new();

    fn from_raw(raw: u32) -> Self {
        Self::from_bits(raw)
    }

    fn raw(self) -> u32 {
        self.bits()
    }

    fn new_big_page(phys: PhysicalAddress, writable: bool) -> Self {
        Self::new()
            .with(Self::KIND, KIND_SECTION)
            .with(Self::DOMAIN, KERNEL_DOMAIN)
            .with(Self::TEX, TEX_WRITE_BACK)
            .with(Self::CACHEABLE, true)
            .with(Self::BUFFERABLE, true)
            .with(Self::AP, if writable { AP_FULL } else { AP_USER_RO })
            .with(Self::SECTION_BASE, phys.get() >> SECTION_SHIFT)
    }

    fn new_table(table: PhysicalAddress) -> Self {
        debug_assert_eq!(table.get() & !COARSE_TABLE_MASK, 0);
        let kind = Self::new()
            .with(Self::KIND, KIND_COARSE)
            .with(Self::DOMAIN, KERNEL_DOMAIN);
        Self::from_bits(kind.bits() | (table.get() & COARSE_TABLE_MASK))
    }

    fn is_present(self) -> bool {
        self.get(Self::KIND) != KIND_FAULT
    }

    fn is_big_page(self) -> bool {
        self.is_section()
    }

    fn is_writable(self) -> bool {
        if self.is_section() {
            !self.get(Self::AP2) && self.get(Self::AP) == AP_FULL
        } else {
            // coarse tables carry no permissions
            self.is_coarse_table()
        }
    }

    fn address(self) -> PhysicalAddress {
        if self.is_section() {
            PhysicalAddress::new(self.get(Self::SECTION_BASE) << SECTION_SHIFT)
        } else {
            PhysicalAddress::new(self.bits() & COARSE_TABLE_MASK)
        }
    }
}

impl L2Descriptor {
    /// Small page only accessible from kernel mode.
    #[must_use]
    pub fn new_kernel_page(phys: PhysicalAddress) -> Self {
        <Self as TableEntry>::new_page(phys, true).with(Self::AP, AP_KERNEL_RW)
    }
}

impl TableEntry for L2Descriptor {
    const VACANT: Self = Self::new();

    fn from_raw(raw: u32) -> Self {
        Self::from_bits(raw)
    }

    fn raw(self) -> u32 {
        self.bits()
    }

    fn new_page(phys: PhysicalAddress, writable: bool) -> Self {
        debug_assert!(phys.is_aligned_to(ArmV7::PAGE_SIZE));
        Self::new()
            .with(Self::SMALL_PAGE, true)
            .with(Self::TEX, TEX_WRITE_BACK)
            .with(Self::CACHEABLE, true)
            .with(Self::BUFFERABLE, true)
            .with(Self::AP, if writable { AP_FULL } else { AP_USER_RO })
            .with(Self::FRAME, phys.get() >> FRAME_SHIFT)
    }

    fn is_present(self) -> bool {
        self.get(Self::SMALL_PAGE)
    }

    fn is_writable(self) -> bool {
        // kernel mode writes are allowed by both "kernel rw" and "full access"
        !self.get(Self::AP2) && matches!(self.get(Self::AP), AP_KERNEL_RW | AP_FULL)
    }

    fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.get(Self::FRAME) << FRAME_SHIFT)
    }
}

#[cfg(target_arch = "arm")]
pub use hw::ArmV7Cpu;

#[cfg(target_arch = "arm")]
mod hw {
    use core::arch::asm;

    use super::ArmV7;
    use crate::arch::Arch;
    use crate::{PhysicalAddress, VirtualAddress};

    unsafe extern "C" {
        /// Fault-catching word copy, returns the faulting address or zero.
        fn phys_copy_catch(src: u32, dst: u32, len: u32) -> u32;
        /// Fault-catching word fill, returns the faulting address or zero.
        fn phys_memset_catch(dst: u32, pattern: u32, len: u32) -> u32;
    }

    const TTBR_ADDR_MASK: u32 = !0x3fff;

    fn caught(addr: u32) -> Result<(), VirtualAddress> {
        match addr {
            0 => Ok(()),
            addr => Err(VirtualAddress::new(addr)),
        }
    }

    /// The CPU the code is running on.
    #[derive(Debug, Default)]
    pub struct ArmV7Cpu;

    impl Arch for ArmV7Cpu {
        type Mode = ArmV7;

        fn active_root(&self) -> Option<PhysicalAddress> {
            let ttbr0: u32;
            // Safety: reading TTBR0 has no side effects
            unsafe { asm!("mrc p15, 0, {}, c2, c0, 0", out(reg) ttbr0, options(nomem, nostack)) };
            (ttbr0 != 0).then_some(PhysicalAddress::new(ttbr0 & TTBR_ADDR_MASK))
        }

        unsafe fn set_active_root(&self, root: PhysicalAddress) {
            // Safety: ensured by caller
            unsafe {
                asm!(
                    "dsb",
                    "mcr p15, 0, {root}, c2, c0, 0",
                    "mcr p15, 0, {zero}, c8, c7, 0",
                    "dsb",
                    "isb",
                    root = in(reg) root.get(),
                    zero = in(reg) 0_u32,
                    options(nostack)
                );
            }
        }

        fn reload_translations(&self) {
            // Safety: invalidating the unified TLB has no other effects
            unsafe {
                asm!(
                    "dsb",
                    "mcr p15, 0, {zero}, c8, c7, 0",
                    "dsb",
                    "isb",
                    zero = in(reg) 0_u32,
                    options(nostack)
                );
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
