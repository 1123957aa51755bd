// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::sync::atomic::{AtomicBool, Ordering};

use kmem::arch::Arch;
use kmem::{CopyFault, PhysicalAddress, Target, Translation, VirtualAddress};

use crate::kernel::InKernel;
use crate::proc::{MiscFlags, Proc};
use crate::{Endpoint, Error};

/// An address in the linear address space of a process, or a physical address if the
/// endpoint is [`Endpoint::NONE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirAddr {
    pub endpoint: Endpoint,
    pub offset: VirtualAddress,
}

impl VirAddr {
    #[must_use]
    pub const fn new(endpoint: Endpoint, offset: VirtualAddress) -> Self {
        Self { endpoint, offset }
    }

    #[must_use]
    pub const fn physical(addr: PhysicalAddress) -> Self {
        Self {
            endpoint: Endpoint::NONE,
            offset: addr.identity(),
        }
    }
}

fn target(proc: Option<&Proc>) -> Target<'_> {
    proc.map_or(Target::Physical, |proc| Target::Process(proc.mem()))
}

/// Set while this CPU runs a fill that is allowed to fault, cleared again on drop.
struct CatchPagefaults<'a>(&'a AtomicBool);

impl<'a> CatchPagefaults<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        let was_set = flag.swap(true, Ordering::AcqRel);
        assert!(!was_set, "nested page fault catching");
        Self(flag)
    }
}

impl Drop for CatchPagefaults<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<A: Arch> InKernel<'_, A> {
    /// Short-circuits a restarted kernel call whose memory request the VM server could not
    /// satisfy.
    ///
    /// # Errors
    ///
    /// Returns the VM server's verdict if `caller` is being resumed and the verdict was a
    /// failure.
    ///
    /// # Panics
    ///
    /// Panics if `caller` is resumed before the VM server answered.
    pub fn check_resumed_caller(&self, caller: Option<&Proc>) -> Result<(), Error> {
        let Some(caller) = caller else {
            return Ok(());
        };
        if !caller.misc_flags().contains(MiscFlags::KCALL_RESUME) {
            return Ok(());
        }

        let vmresult = caller.vm_state().vmresult;
        assert_ne!(
            vmresult,
            Err(Error::VmSuspend),
            "process {} resumed before the VM server answered",
            caller.nr()
        );
        vmresult
    }

    /// Resolves one side of a copy. `None` is physical memory.
    fn copy_target<'a>(
        &'a self,
        caller: Option<&'a Proc>,
        endpoint: Endpoint,
    ) -> Result<Option<&'a Proc>, Error> {
        let resolved = match (endpoint, caller) {
            (Endpoint::NONE, _) => return Ok(None),
            (Endpoint::SELF, Some(caller)) => Ok(caller),
            _ => self.procs().get(endpoint),
        };

        match resolved {
            Ok(proc) => Ok(Some(proc)),
            Err(err) => {
                log::warn!("virtual_copy: no reasonable endpoint {endpoint:?}");
                Err(err)
            }
        }
    }

    /// Copies `len` bytes between processes or physical memory. A page fault fails the
    /// copy, there is no retry through the VM server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Domain`] for empty copies, [`Error::NoSuchProcess`] for endpoints
    /// that are neither live nor [`Endpoint::NONE`], and [`Error::SourceFault`] or
    /// [`Error::DestinationFault`] if either side faults.
    ///
    /// # Panics
    ///
    /// Panics if no address space is loaded on this CPU, see also [`kmem::CpuContext::copy`].
    pub fn virtual_copy(&self, src: VirAddr, dst: VirAddr, len: u32) -> Result<(), Error> {
        self.virtual_copy_f(None, src, dst, len)
    }

    /// Like [`Self::virtual_copy`], but a page fault in a process suspends `caller` until
    /// the VM server resolved it.
    ///
    /// # Errors
    ///
    /// Like [`Self::virtual_copy`], except that faults return [`Error::VmSuspend`]. A
    /// restarted call returns the VM server's verdict if that was a failure.
    ///
    /// # Panics
    ///
    /// Panics if physical memory faults, as there is nothing the VM server could do about
    /// it, and in the cases of [`Self::virtual_copy`].
    pub fn virtual_copy_vmcheck(
        &self,
        caller: &Proc,
        src: VirAddr,
        dst: VirAddr,
        len: u32,
    ) -> Result<(), Error> {
        self.virtual_copy_f(Some(caller), src, dst, len)
    }

    fn virtual_copy_f(
        &self,
        caller: Option<&Proc>,
        src: VirAddr,
        dst: VirAddr,
        len: u32,
    ) -> Result<(), Error> {
        if len == 0 {
            return Err(Error::Domain);
        }

        let src_proc = self.copy_target(caller, src.endpoint)?;
        let dst_proc = self.copy_target(caller, dst.endpoint)?;

        self.check_resumed_caller(caller)?;

        let Err(fault) =
            self.context()
                .copy(target(src_proc), src.offset, target(dst_proc), dst.offset, len)
        else {
            return Ok(());
        };

        let Some(caller) = caller else {
            return Err(fault.into());
        };

        let (proc, start, write) = match fault {
            CopyFault::Source(_) => (src_proc, src.offset, false),
            CopyFault::Destination(_) => (dst_proc, dst.offset, true),
        };
        let Some(proc) = proc else {
            panic!(
                "CPU {}: {fault} in physical memory on behalf of process {}",
                self.cpu(),
                caller.nr()
            );
        };

        self.vm_suspend(caller, proc, start, len, write, fault.addr());
        Err(Error::VmSuspend)
    }

    /// Copies between two processes that are always resident, such as the kernel tasks.
    ///
    /// # Errors
    ///
    /// See [`Self::virtual_copy`].
    ///
    /// # Panics
    ///
    /// Panics if either endpoint is [`Endpoint::NONE`].
    pub fn data_copy(
        &self,
        from: Endpoint,
        from_addr: VirtualAddress,
        to: Endpoint,
        to_addr: VirtualAddress,
        len: u32,
    ) -> Result<(), Error> {
        assert!(from != Endpoint::NONE && to != Endpoint::NONE, "data_copy with NONE endpoint");
        self.virtual_copy(VirAddr::new(from, from_addr), VirAddr::new(to, to_addr), len)
    }

    /// [`Self::data_copy`] with retry through the VM server.
    ///
    /// # Errors
    ///
    /// See [`Self::virtual_copy_vmcheck`].
    ///
    /// # Panics
    ///
    /// Panics if either endpoint is [`Endpoint::NONE`].
    pub fn data_copy_vmcheck(
        &self,
        caller: &Proc,
        from: Endpoint,
        from_addr: VirtualAddress,
        to: Endpoint,
        to_addr: VirtualAddress,
        len: u32,
    ) -> Result<(), Error> {
        assert!(from != Endpoint::NONE && to != Endpoint::NONE, "data_copy with NONE endpoint");
        self.virtual_copy_vmcheck(
            caller,
            VirAddr::new(from, from_addr),
            VirAddr::new(to, to_addr),
            len,
        )
    }

    /// Fills `len` bytes at `addr` of `target` (physical memory for [`Endpoint::NONE`])
    /// with `byte` on behalf of `caller`. A page fault in a process suspends `caller` until
    /// the VM server resolved it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Domain`] for empty fills, [`Error::NoSuchProcess`] for bad endpoints,
    /// [`Error::VmSuspend`] on faults and the VM server's verdict on restarted calls that
    /// it could not satisfy.
    ///
    /// # Panics
    ///
    /// Panics if physical memory faults or if this CPU already catches page faults.
    pub fn vm_memset(
        &self,
        caller: &Proc,
        endpoint: Endpoint,
        addr: VirtualAddress,
        byte: u8,
        len: u32,
    ) -> Result<(), Error> {
        if len == 0 {
            return Err(Error::Domain);
        }

        self.check_resumed_caller(Some(caller))?;
        let proc = self.copy_target(Some(caller), endpoint)?;

        let _catching = CatchPagefaults::enter(self.catch_pagefaults());
        let Err(fault) = self.context().fill(target(proc), addr, byte, len) else {
            return Ok(());
        };

        let Some(proc) = proc else {
            panic!("CPU {}: {fault} in physical memory", self.cpu());
        };
        log::trace!("vm_memset: {fault}");

        self.vm_suspend(caller, proc, addr, len, true, fault.addr);
        Err(Error::VmSuspend)
    }

    /// Asks the VM server to make `[addr, addr + len)` of `target` accessible before
    /// `caller` retries whatever faulted on it.
    ///
    /// # Errors
    ///
    /// Returns the VM server's verdict if `caller` is being resumed and the verdict was a
    /// failure, [`Error::VmSuspend`] otherwise.
    ///
    /// # Panics
    ///
    /// Panics if `caller` or `target` already wait for the VM server.
    pub fn vm_check_range(
        &self,
        caller: &Proc,
        target: &Proc,
        addr: VirtualAddress,
        len: u32,
        write: bool,
    ) -> Result<(), Error> {
        if caller.misc_flags().contains(MiscFlags::KCALL_RESUME) {
            let vmresult = caller.vm_state().vmresult;
            if vmresult.is_err() {
                return vmresult;
            }
        }

        self.vm_suspend(caller, target, addr, len, write, addr);
        Err(Error::VmSuspend)
    }

    /// Translates `virt` in the address space of `proc`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fault`] if `virt` is not mapped.
    ///
    /// # Panics
    ///
    /// Panics if no address space is loaded on this CPU.
    pub fn lookup_physical(&self, proc: &Proc, virt: VirtualAddress) -> Result<Translation, Error> {
        Ok(self.context().translate(proc.mem(), virt)?)
    }

    /// Length of the physically contiguous run of up to `len` bytes at `virt` in `proc`,
    /// zero if `virt` itself is not mapped.
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero or no address space is loaded on this CPU.
    pub fn lookup_contiguous_range(&self, proc: &Proc, virt: VirtualAddress, len: u32) -> u32 {
        self.context().contiguous_length(proc.mem(), virt, len)
    }

    /// Physical address of `virt` in `proc`, if all `len` bytes from there on are
    /// physically contiguous.
    ///
    /// # Panics
    ///
    /// Panics if no address space is loaded on this CPU.
    pub fn umap_virtual(&self, proc: &Proc, virt: VirtualAddress, len: u32) -> Option<PhysicalAddress> {
        self.context().umap_virtual(proc.mem(), virt, len)
    }
}

#[cfg(test)]
mod tests {
    use kmem::test_utils::pattern;
    use kmem::{PhysicalAddress, ProcNr, RtsFlags, VirtualAddress};
    use kwin_util::CpuId;

    use super::*;
    use crate::test_utils::{TestKernel, USER_BASE};
    use crate::vm::{MemRequest, RequestKind};

    #[test_log::test]
    fn copies_between_processes() {
        let t = TestKernel::new();
        let (a, a_space) = t.spawn(5);
        let (b, b_space) = t.spawn(6);
        let data = pattern(10_000, 1);
        t.populate(&a_space, USER_BASE, &data);
        let b_phys = t.populate(&b_space, USER_BASE, &[0; 10_000]);

        let k = t.kernel.enter(CpuId::BOOT);
        k.virtual_copy(
            VirAddr::new(a, USER_BASE.add(5)),
            VirAddr::new(b, USER_BASE.add(17)),
            9000,
        )
        .unwrap();

        assert_eq!(t.machine.read_phys(b_phys.add(17), 9000), data[5..9005]);
        assert_eq!(t.machine.read_phys(b_phys, 17), [0; 17]);
    }

    #[test_log::test]
    fn physical_to_unmapped_destination() {
        let t = TestKernel::new();
        let (a, a_space) = t.spawn(5);
        let a_phys = t.populate(&a_space, USER_BASE, &[0; 4096]);
        let data = pattern(8192, 2);
        t.machine.write_phys(PhysicalAddress::new(0x1000), &data);

        let k = t.kernel.enter(CpuId::BOOT);
        let err = k
            .virtual_copy(
                VirAddr::physical(PhysicalAddress::new(0x1000)),
                VirAddr::new(a, USER_BASE),
                8192,
            )
            .unwrap_err();

        assert_eq!(err, Error::DestinationFault(USER_BASE.add(0x1000)));
        assert_eq!(t.machine.read_phys(a_phys, 4096), data[..4096]);
    }

    #[test]
    fn rejects_empty_copies_and_bad_endpoints() {
        let t = TestKernel::new();
        let (a, _) = t.spawn(5);
        let k = t.kernel.enter(CpuId::BOOT);

        let src = VirAddr::new(a, USER_BASE);
        let dst = VirAddr::physical(PhysicalAddress::new(0x1000));
        assert_eq!(k.virtual_copy(src, dst, 0), Err(Error::Domain));

        let stale = VirAddr::new(Endpoint::new(7, ProcNr(5)), USER_BASE);
        assert_eq!(k.virtual_copy(stale, dst, 16), Err(Error::NoSuchProcess));
        assert_eq!(
            k.virtual_copy(src, VirAddr::new(Endpoint::ANY, USER_BASE), 16),
            Err(Error::NoSuchProcess)
        );
        // SELF means the caller, and plain copies have none
        assert_eq!(
            k.virtual_copy(VirAddr::new(Endpoint::SELF, USER_BASE), dst, 16),
            Err(Error::NoSuchProcess)
        );
    }

    #[test_log::test]
    fn kernel_tasks_copy_through_the_loaded_address_space() {
        let t = TestKernel::new();
        let (a, a_space) = t.spawn(5);
        let a_phys = t.populate(&a_space, USER_BASE, &[0; 64]);
        let data = pattern(64, 3);
        t.machine.write_phys(PhysicalAddress::new(0x5000), &data);

        let k = t.kernel.enter(CpuId::BOOT);
        k.data_copy(Endpoint::SYSTEM, VirtualAddress::new(0x5000), a, USER_BASE, 64)
            .unwrap();
        assert_eq!(t.machine.read_phys(a_phys, 64), data);
    }

    #[test]
    #[should_panic(expected = "data_copy with NONE endpoint")]
    fn data_copy_needs_processes() {
        let t = TestKernel::new();
        let k = t.kernel.enter(CpuId::BOOT);
        let _ = k.data_copy(
            Endpoint::NONE,
            VirtualAddress::new(0x1000),
            Endpoint::SYSTEM,
            VirtualAddress::new(0x2000),
            4,
        );
    }

    #[test_log::test]
    fn vmcheck_suspends_on_destination_fault() {
        let t = TestKernel::new();
        let (a, a_space) = t.spawn(5);
        let (b, b_space) = t.spawn(6);
        t.populate(&a_space, USER_BASE, &pattern(8192, 4));
        t.populate(&b_space, USER_BASE, &[0; 4096]);

        let k = t.kernel.enter(CpuId::BOOT);
        let caller = k.procs().get(b).unwrap();
        let result = k.data_copy_vmcheck(caller, a, USER_BASE, b, USER_BASE, 8192);
        assert_eq!(result, Err(Error::VmSuspend));
        assert!(caller.mem().rts_flags().contains(RtsFlags::VM_REQUEST));

        assert_eq!(
            k.memreq_get(),
            Some(MemRequest {
                requestor: b,
                target: b,
                start: USER_BASE,
                len: 8192,
                write: true,
                fault: USER_BASE.add(0x1000),
                kind: RequestKind::KernelCall,
            })
        );
        assert_eq!(k.memreq_get(), None);
    }

    #[test_log::test]
    fn vmcheck_suspends_on_source_fault() {
        let t = TestKernel::new();
        let (a, _) = t.spawn(5);
        let (b, b_space) = t.spawn(6);
        t.populate(&b_space, USER_BASE, &[0; 4096]);

        let k = t.kernel.enter(CpuId::BOOT);
        let caller = k.procs().get(b).unwrap();
        let result = k.virtual_copy_vmcheck(
            caller,
            VirAddr::new(a, USER_BASE.add(0x10)),
            VirAddr::new(Endpoint::SELF, USER_BASE),
            0x20,
        );
        assert_eq!(result, Err(Error::VmSuspend));

        let request = k.memreq_get().unwrap();
        assert_eq!(request.requestor, b);
        assert_eq!(request.target, a);
        assert_eq!(request.start, USER_BASE.add(0x10));
        assert_eq!(request.len, 0x20);
        assert!(!request.write);
    }

    #[test]
    #[should_panic(expected = "in physical memory")]
    fn vmcheck_physical_fault_is_fatal() {
        let t = TestKernel::new();
        let (a, a_space) = t.spawn(5);
        t.populate(&a_space, USER_BASE, &[0; 4096]);

        let k = t.kernel.enter(CpuId::BOOT);
        let caller = k.procs().get(a).unwrap();
        let _ = k.virtual_copy_vmcheck(
            caller,
            VirAddr::physical(PhysicalAddress::new(0x2000_0000)),
            VirAddr::new(a, USER_BASE),
            16,
        );
    }

    #[test]
    fn resumed_callers_get_the_verdict() {
        let t = TestKernel::new();
        let (a, _) = t.spawn(5);
        let k = t.kernel.enter(CpuId::BOOT);
        let caller = k.procs().get(a).unwrap();

        assert_eq!(k.check_resumed_caller(None), Ok(()));
        assert_eq!(k.check_resumed_caller(Some(caller)), Ok(()));

        caller.vm_state().vmresult = Err(Error::NoMemory);
        assert_eq!(k.check_resumed_caller(Some(caller)), Ok(()));
        caller.set_misc_flags(MiscFlags::KCALL_RESUME);
        assert_eq!(k.check_resumed_caller(Some(caller)), Err(Error::NoMemory));

        // a failed verdict ends the copy before it is attempted
        let src = VirAddr::new(a, USER_BASE);
        let dst = VirAddr::physical(PhysicalAddress::new(0x1000));
        assert_eq!(k.virtual_copy_vmcheck(caller, src, dst, 4), Err(Error::NoMemory));
    }

    #[test]
    #[should_panic(expected = "resumed before the VM server answered")]
    fn resuming_early_is_fatal() {
        let t = TestKernel::new();
        let (a, _) = t.spawn(5);
        let k = t.kernel.enter(CpuId::BOOT);
        let caller = k.procs().get(a).unwrap();
        caller.vm_state().vmresult = Err(Error::VmSuspend);
        caller.set_misc_flags(MiscFlags::KCALL_RESUME);
        let _ = k.check_resumed_caller(Some(caller));
    }

    #[test_log::test]
    fn memset_physical_and_virtual() {
        let t = TestKernel::new();
        let (a, a_space) = t.spawn(5);
        let a_phys = t.populate(&a_space, USER_BASE, &[0; 8192]);

        let k = t.kernel.enter(CpuId::BOOT);
        let caller = k.procs().get(a).unwrap();

        k.vm_memset(caller, Endpoint::NONE, VirtualAddress::new(0x4001), 0xab, 100)
            .unwrap();
        assert_eq!(t.machine.read_phys(PhysicalAddress::new(0x4000), 1), [0]);
        assert_eq!(t.machine.read_phys(PhysicalAddress::new(0x4001), 100), [0xab; 100]);
        assert_eq!(t.machine.read_phys(PhysicalAddress::new(0x4065), 1), [0]);

        k.vm_memset(caller, a, USER_BASE.add(0xff0), 0x5a, 0x20).unwrap();
        assert_eq!(t.machine.read_phys(a_phys.add(0xff0), 0x20), [0x5a; 0x20]);
        assert!(!k.catch_pagefaults().load(Ordering::Relaxed));

        assert_eq!(
            k.vm_memset(caller, a, USER_BASE, 0, 0),
            Err(Error::Domain)
        );
    }

    #[test_log::test]
    fn memset_fault_suspends_for_the_whole_range() {
        let t = TestKernel::new();
        let (a, a_space) = t.spawn(5);
        let (b, _) = t.spawn(6);
        t.populate(&a_space, USER_BASE, &[0; 4096]);

        let k = t.kernel.enter(CpuId::BOOT);
        let caller = k.procs().get(b).unwrap();
        assert_eq!(
            k.vm_memset(caller, a, USER_BASE.add(0x800), 1, 0x1000),
            Err(Error::VmSuspend)
        );
        assert!(!k.catch_pagefaults().load(Ordering::Relaxed));

        let request = k.memreq_get().unwrap();
        assert_eq!(request.requestor, b);
        assert_eq!(request.target, a);
        assert_eq!(request.start, USER_BASE.add(0x800));
        assert_eq!(request.len, 0x1000);
        assert_eq!(request.fault, USER_BASE.add(0x1000));
        assert!(request.write);
    }

    #[test]
    fn check_range_reports_failed_verdicts() {
        let t = TestKernel::new();
        let (a, _) = t.spawn(5);
        let (b, _) = t.spawn(6);
        let k = t.kernel.enter(CpuId::BOOT);
        let caller = k.procs().get(a).unwrap();
        let target = k.procs().get(b).unwrap();

        assert_eq!(
            k.vm_check_range(caller, target, USER_BASE, 0x3000, false),
            Err(Error::VmSuspend)
        );
        let request = k.memreq_get().unwrap();
        assert_eq!((request.target, request.fault), (b, USER_BASE));

        k.memreq_reply(a, Err(Error::NoMemory)).unwrap();
        assert_eq!(
            k.vm_check_range(caller, target, USER_BASE, 0x3000, false),
            Err(Error::NoMemory)
        );
    }

    #[test_log::test]
    fn lookups() {
        let t = TestKernel::new();
        let (a, a_space) = t.spawn(5);
        let phys = t.populate(&a_space, USER_BASE, &[0; 0x3000]);

        let k = t.kernel.enter(CpuId::BOOT);
        let proc = k.procs().get(a).unwrap();

        let translation = k.lookup_physical(proc, USER_BASE.add(0x1234)).unwrap();
        assert_eq!(translation.phys, phys.add(0x1234));
        assert!(translation.writable);

        assert_eq!(k.lookup_contiguous_range(proc, USER_BASE.add(0x10), 0x10_000), 0x2ff0);
        assert_eq!(k.lookup_contiguous_range(proc, USER_BASE, 0x1800), 0x1800);
        assert_eq!(k.umap_virtual(proc, USER_BASE.add(8), 0x2000), Some(phys.add(8)));

        let unmapped = USER_BASE.add(0x3000);
        assert_eq!(k.lookup_physical(proc, unmapped), Err(Error::Fault(unmapped)));
        assert_eq!(k.lookup_contiguous_range(proc, unmapped, 0x1000), 0);
        assert_eq!(k.umap_virtual(proc, USER_BASE, 0x4000), None);
    }
}
