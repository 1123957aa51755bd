// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use kwin_util::CpuId;

use crate::arch::{Arch, PagingMode};
use crate::test_utils::Machine;
use crate::{PhysicalAddress, VirtualAddress};

/// One CPU of an emulated [`Machine`].
///
/// Page directory views are identity mapped: [`Arch::read_word`] and [`Arch::write_word`]
/// access physical memory directly.
pub struct EmulateArch<M> {
    machine: Machine<M>,
    cpu: CpuId,
}

impl<M: PagingMode> EmulateArch<M> {
    pub const fn new(machine: Machine<M>, cpu: CpuId) -> Self {
        Self { machine, cpu }
    }

    pub const fn machine(&self) -> &Machine<M> {
        &self.machine
    }

    pub const fn cpu(&self) -> CpuId {
        self.cpu
    }
}

impl<M: PagingMode> fmt::Debug for EmulateArch<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulateArch")
            .field("mode", &M::NAME)
            .field("cpu", &self.cpu)
            .finish_non_exhaustive()
    }
}

impl<M: PagingMode> Arch for EmulateArch<M> {
    type Mode = M;

    fn active_root(&self) -> Option<PhysicalAddress> {
        self.machine.active_root(self.cpu)
    }

    unsafe fn set_active_root(&self, root: PhysicalAddress) {
        self.machine.set_active_root(self.cpu, root);
    }

    fn reload_translations(&self) {
        self.machine.reload(self.cpu);
    }

    unsafe fn read_word(&self, addr: VirtualAddress) -> u32 {
        self.machine.read_phys_u32(PhysicalAddress::new(addr.get()))
    }

    unsafe fn write_word(&self, addr: VirtualAddress, value: u32) {
        self.machine
            .write_phys_u32(PhysicalAddress::new(addr.get()), value);
    }

    unsafe fn copy_catch(
        &self,
        src: VirtualAddress,
        dst: VirtualAddress,
        len: u32,
    ) -> Result<(), VirtualAddress> {
        self.machine.copy(self.cpu, src, dst, len)
    }

    unsafe fn read_catch(&self, src: VirtualAddress, buf: &mut [u8]) -> Result<(), VirtualAddress> {
        self.machine.read(self.cpu, src, buf)
    }

    unsafe fn fill_catch(
        &self,
        dst: VirtualAddress,
        pattern: u32,
        len: u32,
    ) -> Result<(), VirtualAddress> {
        self.machine.fill(self.cpu, dst, pattern, len)
    }
}
