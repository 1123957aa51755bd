// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use kwin_util::{CpuId, CpuSet};

use crate::{PhysicalAddress, VirtualAddress};

bitflags! {
    /// Reasons a process cannot run. The memory code only cares about the ones that mean its
    /// address space is being torn down or rebuilt.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RtsFlags: u32 {
        /// The process table slot is not in use.
        const SLOT_FREE = 1 << 0;
        /// The VM server is rebuilding the address space.
        const VM_INHIBIT = 1 << 1;
        /// Suspended until the VM server answers a memory request.
        const VM_REQUEST = 1 << 2;
    }
}

/// Process table slot number. Kernel tasks have negative numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcNr(pub i32);

impl ProcNr {
    #[must_use]
    pub const fn is_kernel(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for ProcNr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The memory-management view of a process.
///
/// `root` is the physical address of its page directory, `view` the linear address through
/// which the kernel can read and write that directory. Kernel tasks run in whatever address
/// space is loaded and have neither.
pub struct ProcessDescriptor {
    nr: ProcNr,
    rts: AtomicU32,
    // zero means "none", neither can legitimately live at address zero
    root: AtomicU32,
    view: AtomicU32,
    stale_translations: CpuSet,
}

impl ProcessDescriptor {
    #[must_use]
    pub const fn new(nr: ProcNr) -> Self {
        Self {
            nr,
            rts: AtomicU32::new(0),
            root: AtomicU32::new(0),
            view: AtomicU32::new(0),
            stale_translations: CpuSet::new(),
        }
    }

    pub fn nr(&self) -> ProcNr {
        self.nr
    }

    pub fn is_kernel(&self) -> bool {
        self.nr.is_kernel()
    }

    pub fn rts_flags(&self) -> RtsFlags {
        RtsFlags::from_bits_retain(self.rts.load(Ordering::Acquire))
    }

    pub fn set_rts_flags(&self, flags: RtsFlags) {
        self.rts.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_rts_flags(&self, flags: RtsFlags) {
        self.rts.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Whether the address space is in a state where the kernel may copy to or from it.
    pub fn is_copyable(&self) -> bool {
        !self
            .rts_flags()
            .intersects(RtsFlags::SLOT_FREE | RtsFlags::VM_INHIBIT)
    }

    pub fn root(&self) -> Option<PhysicalAddress> {
        match self.root.load(Ordering::Acquire) {
            0 => None,
            raw => Some(PhysicalAddress::new(raw)),
        }
    }

    pub fn view(&self) -> Option<VirtualAddress> {
        match self.view.load(Ordering::Acquire) {
            0 => None,
            raw => Some(VirtualAddress::new(raw)),
        }
    }

    /// Installs the page directory of this process, as done by the VM server when it
    /// creates or replaces an address space.
    pub fn set_address_space(&self, root: PhysicalAddress, view: VirtualAddress) {
        debug_assert!(root != PhysicalAddress::ZERO && view != VirtualAddress::ZERO);
        self.root.store(root.get(), Ordering::Release);
        self.view.store(view.get(), Ordering::Release);
    }

    /// Forgets the page directory entirely, as for a process table slot being reused.
    pub fn clear_address_space(&self) {
        self.root.store(0, Ordering::Release);
        self.view.store(0, Ordering::Release);
    }

    /// Forgets the kernel's view of the page directory. The process keeps its root but the
    /// kernel can no longer use it as the target of window writes.
    pub fn release_address_space(&self) {
        log::trace!("process {}: releasing page directory view", self.nr);
        self.view.store(0, Ordering::Release);
    }

    /// Tells every CPU that translations it may have cached for this process are stale.
    pub fn invalidate_translations(&self) {
        self.stale_translations.insert_all();
    }

    /// Consumes the stale-translations notification for `cpu`.
    pub fn take_stale(&self, cpu: CpuId) -> bool {
        self.stale_translations.take(cpu)
    }

    pub fn is_stale_on(&self, cpu: CpuId) -> bool {
        self.stale_translations.contains(cpu)
    }
}

impl fmt::Debug for ProcessDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessDescriptor")
            .field("nr", &self.nr)
            .field("rts", &self.rts_flags())
            .field("root", &self.root())
            .field("view", &self.view())
            .field("stale_translations", &self.stale_translations)
            .finish()
    }
}

/// One side of a copy: a process' linear address space or physical memory.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    Physical,
    Process(&'a ProcessDescriptor),
}

impl<'a> Target<'a> {
    pub fn process(self) -> Option<&'a ProcessDescriptor> {
        match self {
            Target::Physical => None,
            Target::Process(proc) => Some(proc),
        }
    }
}

impl fmt::Display for Target<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Physical => f.write_str("physical"),
            Target::Process(proc) => write!(f, "process {}", proc.nr()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_space_lifecycle() {
        let proc = ProcessDescriptor::new(ProcNr(3));
        assert!(!proc.is_kernel());
        assert_eq!(proc.root(), None);

        proc.set_address_space(PhysicalAddress::new(0x20_0000), VirtualAddress::new(0xf000_0000));
        assert_eq!(proc.root(), Some(PhysicalAddress::new(0x20_0000)));
        assert_eq!(proc.view(), Some(VirtualAddress::new(0xf000_0000)));

        proc.release_address_space();
        assert_eq!(proc.view(), None);
        assert_eq!(proc.root(), Some(PhysicalAddress::new(0x20_0000)));

        proc.clear_address_space();
        assert_eq!(proc.root(), None);
    }

    #[test]
    fn teardown_flags_block_copies() {
        let proc = ProcessDescriptor::new(ProcNr(7));
        assert!(proc.is_copyable());

        proc.set_rts_flags(RtsFlags::VM_INHIBIT | RtsFlags::VM_REQUEST);
        assert!(!proc.is_copyable());

        proc.clear_rts_flags(RtsFlags::VM_INHIBIT);
        assert!(proc.is_copyable());
        assert_eq!(proc.rts_flags(), RtsFlags::VM_REQUEST);
    }

    #[test]
    fn stale_translations_are_per_cpu() {
        let proc = ProcessDescriptor::new(ProcNr(-2));
        assert!(proc.is_kernel());

        proc.invalidate_translations();
        assert!(proc.take_stale(CpuId::new(1)));
        assert!(!proc.is_stale_on(CpuId::new(1)));
        assert!(proc.is_stale_on(CpuId::new(0)));
        assert!(proc.take_stale(CpuId::new(0)));
    }
}
