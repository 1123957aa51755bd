// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Software page table walks.
//!
//! Page tables are read as physical memory, so the walk works for any process regardless of
//! which page directory is loaded.

use crate::arch::{Arch, DirectoryEntry, PagingMode, TableEntry};
use crate::cpu::CpuContext;
use crate::error::{PageFault, WalkLevel};
use crate::process::ProcessDescriptor;
use crate::{PhysicalAddress, VirtualAddress};

/// The result of a successful walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub phys: PhysicalAddress,
    /// The raw leaf entry: the directory entry for big pages, the page table entry otherwise.
    pub entry: u32,
    pub writable: bool,
    pub big_page: bool,
}

impl<A: Arch> CpuContext<'_, A> {
    /// Translates `virt` in the address space of `proc`.
    ///
    /// Processes without a page directory of their own are identity mapped.
    ///
    /// # Errors
    ///
    /// Returns a [`PageFault`] naming the level without a present entry.
    ///
    /// # Panics
    ///
    /// Panics if the page tables cannot be read.
    pub fn translate(
        &self,
        proc: &ProcessDescriptor,
        virt: VirtualAddress,
    ) -> Result<Translation, PageFault> {
        let Some(root) = proc.root() else {
            return Ok(Translation {
                phys: PhysicalAddress::new(virt.get()),
                entry: 0,
                writable: true,
                big_page: false,
            });
        };

        let pde = <A::Mode as PagingMode>::DirEntry::from_raw(self.read_phys_u32(
            root.add(A::Mode::dir_entry_offset(A::Mode::dir_index(virt))),
        ));
        if !pde.is_present() {
            return Err(PageFault {
                addr: virt,
                level: WalkLevel::Directory,
            });
        }

        if pde.is_big_page() {
            return Ok(Translation {
                phys: pde.address().add(A::Mode::window_offset(virt)),
                entry: pde.raw(),
                writable: pde.is_writable(),
                big_page: true,
            });
        }

        let pte = <A::Mode as PagingMode>::TableEntry::from_raw(self.read_phys_u32(
            pde.address()
                .add(A::Mode::table_entry_offset(A::Mode::table_index(virt))),
        ));
        if !pte.is_present() {
            return Err(PageFault {
                addr: virt,
                level: WalkLevel::Table,
            });
        }

        Ok(Translation {
            phys: pte.address().add(virt.get() % A::Mode::PAGE_SIZE),
            entry: pte.raw(),
            writable: pte.is_writable() && pde.is_writable(),
            big_page: false,
        })
    }

    /// Length of the physically contiguous run starting at `virt` in `proc`, at most
    /// `max_bytes`. Zero if `virt` itself is not mapped.
    ///
    /// # Panics
    ///
    /// Panics if `max_bytes` is zero.
    pub fn contiguous_length(
        &self,
        proc: &ProcessDescriptor,
        virt: VirtualAddress,
        max_bytes: u32,
    ) -> u32 {
        assert!(max_bytes > 0, "empty range at {virt}");

        let Ok(first) = self.translate(proc, virt) else {
            return 0;
        };

        let mut len = A::Mode::PAGE_SIZE - virt.get() % A::Mode::PAGE_SIZE;
        let mut virt = virt.wrapping_add(len);
        let mut next_phys = first.phys.wrapping_add(len);

        while len < max_bytes {
            match self.translate(proc, virt) {
                Ok(translation) if translation.phys == next_phys => {}
                _ => break,
            }

            len = len.saturating_add(A::Mode::PAGE_SIZE);
            virt = virt.wrapping_add(A::Mode::PAGE_SIZE);
            next_phys = next_phys.wrapping_add(A::Mode::PAGE_SIZE);
        }

        len.min(max_bytes)
    }

    /// Physical address of `virt` in `proc`, if the `bytes` from there on are mapped to
    /// contiguous physical memory.
    ///
    /// # Panics
    ///
    /// Panics if the page tables cannot be read.
    pub fn umap_virtual(
        &self,
        proc: &ProcessDescriptor,
        virt: VirtualAddress,
        bytes: u32,
    ) -> Option<PhysicalAddress> {
        let phys = match self.translate(proc, virt) {
            Ok(translation) => translation.phys,
            Err(fault) => {
                log::warn!("umap_virtual: process {}: {fault}", proc.nr());
                return None;
            }
        };

        if bytes > 0 && self.contiguous_length(proc, virt, bytes) != bytes {
            log::warn!(
                "umap_virtual: process {}: {bytes:#x} bytes at {virt} not contiguous",
                proc.nr()
            );
            return None;
        }

        Some(phys)
    }
}
