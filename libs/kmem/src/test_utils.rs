// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An emulated machine and fixtures for testing memory access without an MMU.

extern crate std;

mod arch;
mod aspace;
mod machine;
mod memory;
pub mod proptest;

use std::ops::Deref;
use std::sync::Arc;
use std::vec::Vec;

pub use arch::EmulateArch;
pub use aspace::{AddressSpace, FRAME_SIZE, Frames};
use kwin_util::CpuId;
pub use machine::Machine;
pub use memory::Memory;

use crate::arch::{Arch, DirectoryEntry, PagingMode};
use crate::cpu::CpuContext;
use crate::process::{ProcNr, ProcessDescriptor};
use crate::window_alloc::{WindowSlot, WindowSlots};
use crate::{PhysicalAddress, VirtualAddress};

/// End of the physical memory of [`Fixture`] machines, which starts at zero.
pub const MEMORY_END: PhysicalAddress = PhysicalAddress::new(0x0100_0000);
/// Page tables and process memory are allocated from here to [`MEMORY_END`], the memory
/// below is free for physical copies.
pub const FRAMES_START: PhysicalAddress = PhysicalAddress::new(0x0080_0000);

/// A process with an address space in an emulated machine.
pub struct TestProcess<M> {
    descriptor: ProcessDescriptor,
    aspace: AddressSpace<M>,
}

impl<M: PagingMode> TestProcess<M> {
    /// Wraps `aspace`, using the physical address of its page directory as the view.
    pub fn new(nr: ProcNr, aspace: AddressSpace<M>) -> Self {
        let descriptor = ProcessDescriptor::new(nr);
        descriptor.set_address_space(aspace.root(), aspace.root().identity());
        Self { descriptor, aspace }
    }

    pub fn descriptor(&self) -> &ProcessDescriptor {
        &self.descriptor
    }
}

impl<M> Deref for TestProcess<M> {
    type Target = AddressSpace<M>;

    fn deref(&self) -> &Self::Target {
        &self.aspace
    }
}

/// A single CPU machine with [`MEMORY_END`] bytes of memory, that has the page directory of
/// `ptproc` loaded and window slots reserved at the top of the directory.
///
/// The page table owner maps all of physical memory one-to-one.
pub struct Fixture<M: PagingMode> {
    pub machine: Machine<M>,
    pub arch: EmulateArch<M>,
    pub frames: Arc<Frames>,
    pub windows: WindowSlots<M>,
    pub ptproc: TestProcess<M>,
}

impl<M: PagingMode> Fixture<M> {
    pub fn new() -> Self {
        let machine = Machine::new([PhysicalAddress::ZERO..MEMORY_END]);
        let frames = Frames::new(FRAMES_START..MEMORY_END);

        let mut freepde_start = M::DIR_ENTRIES - 4;
        let windows = WindowSlots::reserve(&mut freepde_start);

        let ptproc = TestProcess::new(ProcNr(0), AddressSpace::new(&machine, &frames));
        ptproc.map_identity(PhysicalAddress::ZERO..MEMORY_END);

        let arch = machine.arch(CpuId::BOOT);
        // Safety: emulated
        unsafe { arch.set_active_root(ptproc.root()) };

        Self {
            machine,
            arch,
            frames,
            windows,
            ptproc,
        }
    }

    pub fn context(&self) -> CpuContext<'_, EmulateArch<M>> {
        CpuContext::new(
            CpuId::BOOT,
            &self.arch,
            &self.windows,
            self.ptproc.descriptor(),
        )
    }

    /// A process with an empty address space.
    pub fn process(&self, nr: i32) -> TestProcess<M> {
        TestProcess::new(ProcNr(nr), AddressSpace::new(&self.machine, &self.frames))
    }

    /// A kernel task, which runs in whatever address space is loaded.
    pub fn kernel_task(&self) -> ProcessDescriptor {
        ProcessDescriptor::new(ProcNr(-2))
    }

    /// The directory entry behind `slot` in the loaded page directory.
    pub fn slot_entry(&self, slot: WindowSlot) -> M::DirEntry {
        let index = self.windows.dir_index(slot);
        M::DirEntry::from_raw(
            self.machine
                .read_phys_u32(self.ptproc.root().add(M::dir_entry_offset(index))),
        )
    }

    /// Maps fresh memory for `data` at `virt` in `proc` and fills it in.
    ///
    /// # Panics
    ///
    /// Panics if the range runs off the address space.
    pub fn populate(&self, proc: &TestProcess<M>, virt: VirtualAddress, data: &[u8]) {
        let Ok(len) = u32::try_from(data.len()) else {
            panic!("{:#x} bytes do not fit the address space", data.len());
        };
        let start = virt.align_down(M::PAGE_SIZE);
        let Some(end) = virt
            .checked_add(len)
            .and_then(|end| end.checked_align_up(M::PAGE_SIZE))
        else {
            panic!("{virt} + {len:#x} runs off the address space");
        };

        let span = end.offset_from_unsigned(start);
        let frames = self.frames.alloc(span);
        proc.map(start, frames, span, true);
        self.machine
            .write_phys(frames.add(virt.offset_from_unsigned(start)), data);
    }

    /// Reads `len` bytes at `virt` in `proc` by translating page by page.
    ///
    /// # Panics
    ///
    /// Panics if part of the range is not mapped.
    pub fn read_virt(&self, proc: &TestProcess<M>, virt: VirtualAddress, len: u32) -> Vec<u8> {
        let ctx = self.context();
        let mut out = Vec::with_capacity(len as usize);
        let mut virt = virt;
        let mut remaining = len;
        while remaining > 0 {
            let phys = match ctx.translate(proc.descriptor(), virt) {
                Ok(translation) => translation.phys,
                Err(fault) => panic!("read_virt: {fault}"),
            };
            let n = remaining.min(M::PAGE_SIZE - virt.get() % M::PAGE_SIZE);
            out.extend(self.machine.read_phys(phys, n));
            virt = virt.wrapping_add(n);
            remaining -= n;
        }
        out
    }
}

impl<M: PagingMode> Default for Fixture<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic, non-repeating looking bytes.
pub fn pattern(len: u32, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| {
            let [a, b, ..] = i.to_le_bytes();
            a.wrapping_mul(31) ^ b.wrapping_add(seed)
        })
        .collect()
}
