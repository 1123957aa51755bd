// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use kmem::arch::{Arch, PagingMode};
use kmem::{CpuContext, MAX_FREE_PDES, PhysicalAddress, ProcNr, RtsFlags, VirtualAddress, WindowSlots};
use kwin_spin::{KernelLock, KernelLockGuard};
use kwin_util::CpuId;

use crate::bootargs::Bootargs;
use crate::config::MAX_CPUS;
use crate::memory::VirAddr;
use crate::proc::{CallMask, MiscFlags, Proc, ProcTable};
use crate::vm::VmQueue;
use crate::{Endpoint, Error};

const _: () = assert!(MAX_FREE_PDES == 2, "copies map a source and a destination window");

const NO_PTPROC: i32 = i32::MIN;

/// What the VM server tells the kernel at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    /// First page directory entry that is free in every address space.
    pub freepde_start: usize,
}

/// Takes the window slots out of the free directory entries.
///
/// # Panics
///
/// Panics if the page directory has no room for the slots.
pub fn memory_init<M: PagingMode>(kinfo: &mut BootInfo) -> WindowSlots<M> {
    WindowSlots::reserve(&mut kinfo.freepde_start)
}

/// A kernel call as decoded from the caller's message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelCall {
    VirCopy { src: VirAddr, dst: VirAddr, len: u32 },
    Memset {
        target: Endpoint,
        addr: VirtualAddress,
        byte: u8,
        len: u32,
    },
}

impl KernelCall {
    fn required(&self) -> CallMask {
        match self {
            KernelCall::VirCopy { .. } => CallMask::VIRCOPY,
            KernelCall::Memset { .. } => CallMask::MEMSET,
        }
    }
}

struct Cpu<A> {
    arch: A,
    /// The process whose page directory is loaded.
    ptproc: AtomicI32,
    catch_pagefaults: AtomicBool,
}

/// The memory side of the kernel: process table, per-CPU state, window slots and the
/// queue of processes waiting for the VM server.
///
/// All of it is only touched from inside the kernel, see [`Kernel::enter`].
pub struct Kernel<A: Arch> {
    lock: KernelLock<MAX_CPUS>,
    cpus: Vec<Cpu<A>>,
    windows: WindowSlots<A::Mode>,
    procs: ProcTable,
    vm_queue: VmQueue,
}

impl<A: Arch> Kernel<A> {
    /// Boots the kernel on `cpus`, numbered in iteration order.
    ///
    /// # Panics
    ///
    /// Panics if there are no or too many CPUs, or if the window slots do not fit.
    pub fn new(args: &Bootargs, kinfo: &mut BootInfo, cpus: impl IntoIterator<Item = A>) -> Self {
        let cpus: Vec<_> = cpus
            .into_iter()
            .map(|arch| Cpu {
                arch,
                ptproc: AtomicI32::new(NO_PTPROC),
                catch_pagefaults: AtomicBool::new(false),
            })
            .collect();
        assert!(
            !cpus.is_empty() && cpus.len() <= MAX_CPUS,
            "cannot boot on {} CPUs",
            cpus.len()
        );

        let windows = memory_init(kinfo);
        log::info!(
            "{}: booted {} CPUs, window slots {windows:?}",
            <A::Mode as PagingMode>::NAME,
            cpus.len()
        );

        Self {
            lock: KernelLock::new(args.bkl),
            cpus,
            windows,
            procs: ProcTable::new(),
            vm_queue: VmQueue::new(),
        }
    }

    pub fn procs(&self) -> &ProcTable {
        &self.procs
    }

    pub fn windows(&self) -> &WindowSlots<A::Mode> {
        &self.windows
    }

    pub fn lock(&self) -> &KernelLock<MAX_CPUS> {
        &self.lock
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Memory requests not yet picked up by the VM server.
    pub fn pending_vm_requests(&self) -> usize {
        self.vm_queue.len()
    }

    /// Enters the kernel on `cpu`, spinning until the big kernel lock is ours.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` was not booted.
    pub fn enter(&self, cpu: CpuId) -> InKernel<'_, A> {
        let Some(state) = self.cpus.get(cpu.get()) else {
            panic!("CPU {cpu} was not booted");
        };

        InKernel {
            kernel: self,
            state,
            guard: self.lock.enter(cpu),
        }
    }
}

impl<A: Arch> fmt::Debug for Kernel<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("lock", &self.lock)
            .field("windows", &self.windows)
            .field("procs", &self.procs)
            .field("vm_queue", &self.vm_queue)
            .finish_non_exhaustive()
    }
}

/// A CPU running inside the kernel, holding the big kernel lock until dropped.
pub struct InKernel<'k, A: Arch> {
    kernel: &'k Kernel<A>,
    state: &'k Cpu<A>,
    guard: KernelLockGuard<'k, MAX_CPUS>,
}

impl<'k, A: Arch> InKernel<'k, A> {
    pub fn cpu(&self) -> CpuId {
        self.guard.cpu()
    }

    pub fn procs(&self) -> &'k ProcTable {
        &self.kernel.procs
    }

    pub(crate) fn vm_queue(&self) -> &'k VmQueue {
        &self.kernel.vm_queue
    }

    pub(crate) fn catch_pagefaults(&self) -> &'k AtomicBool {
        &self.state.catch_pagefaults
    }

    /// The process whose page directory is loaded on this CPU.
    pub fn ptproc(&self) -> Option<&'k Proc> {
        match self.state.ptproc.load(Ordering::Acquire) {
            NO_PTPROC => None,
            nr => self.procs().by_nr(ProcNr(nr)),
        }
    }

    /// The memory access state of this CPU.
    ///
    /// # Panics
    ///
    /// Panics if no address space was loaded yet.
    pub fn context(&self) -> CpuContext<'k, A> {
        let Some(ptproc) = self.ptproc() else {
            panic!("CPU {}: no address space loaded", self.cpu());
        };
        CpuContext::new(self.cpu(), &self.state.arch, &self.kernel.windows, ptproc.mem())
    }

    /// Makes `endpoint` the page table owner of this CPU and loads its page directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchProcess`] for bad endpoints and [`Error::InvalidArgument`]
    /// if the process has no page directory.
    pub fn switch_address_space(&self, endpoint: Endpoint) -> Result<(), Error> {
        let proc = self.procs().get(endpoint)?;
        let Some(root) = proc.mem().root() else {
            return Err(Error::InvalidArgument);
        };

        self.state.ptproc.store(proc.nr().0, Ordering::Release);
        if self.state.arch.active_root() != Some(root) {
            log::trace!("CPU {}: loading page directory {root} of {}", self.cpu(), proc.nr());
            // Safety: the VM server maps the kernel into every page directory it hands us
            unsafe { self.state.arch.set_active_root(root) };
        }
        Ok(())
    }

    /// Clears the window slots of the loaded page directory.
    ///
    /// # Panics
    ///
    /// Panics if no address space was loaded yet.
    pub fn mem_clear_mapcache(&self) {
        self.context().clear_windows();
    }

    /// Installs a new page directory for `endpoint` on behalf of the VM server. Every CPU
    /// drops the translations it cached for the process before it next uses them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchProcess`] for bad endpoints.
    pub fn set_address_space(
        &self,
        endpoint: Endpoint,
        root: PhysicalAddress,
        view: VirtualAddress,
    ) -> Result<(), Error> {
        let proc = self.procs().get(endpoint)?;
        log::debug!("process {}: page directory {root}, view {view}", proc.nr());
        proc.mem().set_address_space(root, view);
        proc.mem().invalidate_translations();

        if self.ptproc().is_some_and(|ptproc| core::ptr::eq(ptproc, proc)) {
            self.switch_address_space(endpoint)?;
        }
        Ok(())
    }

    /// Tells every CPU that the VM server changed the page tables of `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchProcess`] for bad endpoints.
    pub fn invalidate_translations(&self, endpoint: Endpoint) -> Result<(), Error> {
        let proc = self.procs().get(endpoint)?;
        proc.mem().invalidate_translations();
        if self.ptproc().is_some_and(|ptproc| core::ptr::eq(ptproc, proc)) {
            self.state.arch.reload_translations();
        }
        Ok(())
    }

    /// Drops the kernel's view of the page directory of `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchProcess`] for bad endpoints.
    pub fn release_address_space(&self, endpoint: Endpoint) -> Result<(), Error> {
        self.procs().get(endpoint)?.mem().release_address_space();
        Ok(())
    }

    /// Frees the slot of `endpoint`, forgetting any memory request it had pending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchProcess`] for bad endpoints.
    pub fn exit(&self, endpoint: Endpoint) -> Result<(), Error> {
        let proc = self.procs().get(endpoint)?;
        self.vm_queue().remove(endpoint);
        proc.mem().clear_rts_flags(RtsFlags::VM_REQUEST);
        proc.clear_misc_flags(MiscFlags::all());
        self.procs().free(proc);
        Ok(())
    }

    /// Runs `call` for `caller`.
    ///
    /// # Errors
    ///
    /// Returns whatever the call returns. [`Error::VmSuspend`] means `caller` waits for the
    /// VM server and the call is restarted with [`Self::kernel_call_resume`] once it
    /// answered.
    ///
    /// # Panics
    ///
    /// Panics if a call suspends without queueing a memory request.
    pub fn kernel_call(&self, caller: Endpoint, call: KernelCall) -> Result<(), Error> {
        let caller = self.procs().get(caller)?;
        let result = self.dispatch(caller, &call);
        self.finish(caller, call, result)
    }

    /// Restarts the suspended kernel call of `caller` after the VM server answered.
    ///
    /// # Errors
    ///
    /// See [`Self::kernel_call`].
    ///
    /// # Panics
    ///
    /// Panics if `caller` has no suspended call or still waits for the VM server.
    pub fn kernel_call_resume(&self, caller: Endpoint) -> Result<(), Error> {
        let caller = self.procs().get(caller)?;
        assert!(
            caller.misc_flags().contains(MiscFlags::KCALL_RESUME)
                && !caller.mem().rts_flags().contains(RtsFlags::VM_REQUEST),
            "process {} has no kernel call ready to resume",
            caller.nr()
        );
        let Some(call) = caller.vm_state().saved.take() else {
            panic!("process {} has no saved kernel call", caller.nr());
        };

        let result = self.dispatch(caller, &call);
        caller.clear_misc_flags(MiscFlags::KCALL_RESUME);
        self.finish(caller, call, result)
    }

    fn dispatch(&self, caller: &Proc, call: &KernelCall) -> Result<(), Error> {
        if !caller.may_call(call.required()) {
            log::warn!("SYSTEM: denied {call:?} from {}", caller.endpoint());
            return Err(Error::CallDenied);
        }

        match *call {
            KernelCall::VirCopy { src, dst, len } => self.virtual_copy_vmcheck(caller, src, dst, len),
            KernelCall::Memset {
                target,
                addr,
                byte,
                len,
            } => self.vm_memset(caller, target, addr, byte, len),
        }
    }

    fn finish(&self, caller: &Proc, call: KernelCall, result: Result<(), Error>) -> Result<(), Error> {
        if result == Err(Error::VmSuspend) {
            assert!(
                caller.mem().rts_flags().contains(RtsFlags::VM_REQUEST),
                "process {} suspended without a memory request",
                caller.nr()
            );
            caller.vm_state().saved = Some(call);
            caller.set_misc_flags(MiscFlags::KCALL_RESUME);
        } else {
            caller.vm_state().saved = None;
        }
        result
    }
}

impl<A: Arch> fmt::Debug for InKernel<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InKernel")
            .field("cpu", &self.cpu())
            .field("ptproc", &self.ptproc().map(Proc::nr))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use kmem::arch::DirectoryEntry;
    use kmem::arch::i386::I386;
    use kmem::test_utils::pattern;
    use kwin_spin::LockKind;

    use super::*;
    use crate::test_utils::{CPUS, TestKernel, USER_BASE};

    #[test_log::test]
    fn boots_with_the_selected_lock() {
        let t = TestKernel::with_args("bkl=spinlock");
        assert_eq!(t.kernel.lock().kind(), LockKind::Spinlock);
        assert_eq!(t.kernel.num_cpus(), CPUS);

        let t = TestKernel::new();
        assert_eq!(t.kernel.lock().kind(), LockKind::Clh);
    }

    #[test]
    fn memory_init_takes_two_entries() {
        let mut kinfo = BootInfo { freepde_start: 100 };
        let windows = memory_init::<I386>(&mut kinfo);
        assert_eq!(kinfo.freepde_start, 102);
        assert_eq!(windows.dir_indices().collect::<Vec<_>>(), [100, 101]);
    }

    #[test]
    #[should_panic(expected = "outside of the 1024 entry page directory")]
    fn memory_init_needs_room() {
        let mut kinfo = BootInfo { freepde_start: 1023 };
        let _ = memory_init::<I386>(&mut kinfo);
    }

    #[test]
    fn enter_holds_the_kernel_lock() {
        let t = TestKernel::new();
        let k = t.kernel.enter(CpuId::new(1));
        assert_eq!(k.cpu(), CpuId::new(1));
        assert_eq!(t.kernel.lock().owner(), Some(CpuId::new(1)));
        assert!(!t.kernel.lock().try_lock(CpuId::BOOT));

        drop(k);
        assert!(!t.kernel.lock().is_locked());
    }

    #[test]
    fn switch_address_space() {
        let t = TestKernel::new();
        let (a, a_space) = t.spawn(5);
        let k = t.kernel.enter(CpuId::BOOT);
        assert_eq!(k.ptproc().map(Proc::endpoint), Some(t.vm()));

        assert_eq!(k.switch_address_space(Endpoint::SYSTEM), Err(Error::InvalidArgument));
        assert_eq!(
            k.switch_address_space(Endpoint::new(3, ProcNr(9))),
            Err(Error::NoSuchProcess)
        );

        k.switch_address_space(a).unwrap();
        assert_eq!(k.ptproc().map(Proc::endpoint), Some(a));
        assert_eq!(t.machine.active_root(CpuId::BOOT), Some(a_space.root()));

        let other = k.procs().get(t.ptprocs[1]).unwrap();
        assert_eq!(t.machine.active_root(CpuId::new(1)), other.mem().root());
    }

    #[test_log::test]
    fn clear_mapcache_vacates_the_windows() {
        let t = TestKernel::new();
        let (a, a_space) = t.spawn(5);
        t.populate(&a_space, USER_BASE, &[1; 16]);

        let k = t.kernel.enter(CpuId::BOOT);
        k.virtual_copy(
            VirAddr::new(a, USER_BASE),
            VirAddr::physical(PhysicalAddress::new(0x1000)),
            16,
        )
        .unwrap();

        let Some(root) = k.ptproc().and_then(|ptproc| ptproc.mem().root()) else {
            panic!("no page directory loaded");
        };
        let vacant = <<I386 as PagingMode>::DirEntry as DirectoryEntry>::VACANT.raw();
        let slots = || {
            t.kernel
                .windows()
                .dir_indices()
                .map(|index| t.machine.read_phys_u32(root.add(I386::dir_entry_offset(index))))
                .collect::<Vec<_>>()
        };
        assert!(slots().iter().all(|entry| *entry != vacant));

        k.mem_clear_mapcache();
        assert_eq!(slots(), [vacant; 2]);
    }

    #[test]
    fn release_address_space_keeps_the_root() {
        let t = TestKernel::new();
        let (a, a_space) = t.spawn(5);
        let k = t.kernel.enter(CpuId::BOOT);

        k.release_address_space(a).unwrap();
        let proc = k.procs().get(a).unwrap();
        assert_eq!(proc.mem().view(), None);
        assert_eq!(proc.mem().root(), Some(a_space.root()));
        assert_eq!(
            k.release_address_space(Endpoint::new(2, ProcNr(5))),
            Err(Error::NoSuchProcess)
        );
    }

    #[test_log::test]
    fn suspended_call_round_trip() {
        let t = TestKernel::new();
        let (a, a_space) = t.spawn(5);
        let (b, b_space) = t.spawn(6);
        let data = pattern(0x2000, 9);
        t.populate(&a_space, USER_BASE, &data);
        let b_first = t.populate(&b_space, USER_BASE, &[0; 0x1000]);
        let call = KernelCall::VirCopy {
            src: VirAddr::new(a, USER_BASE),
            dst: VirAddr::new(Endpoint::SELF, USER_BASE),
            len: 0x2000,
        };

        {
            let k = t.kernel.enter(CpuId::BOOT);
            assert_eq!(k.kernel_call(b, call), Err(Error::VmSuspend));
            let caller = k.procs().get(b).unwrap();
            assert!(caller.misc_flags().contains(MiscFlags::KCALL_RESUME));
            assert!(caller.mem().rts_flags().contains(RtsFlags::VM_REQUEST));
        }
        assert_eq!(t.kernel.pending_vm_requests(), 1);

        // the VM server runs on the other CPU
        let b_second = {
            let k = t.kernel.enter(CpuId::new(1));
            let request = k.memreq_get().unwrap();
            assert_eq!(request.requestor, b);
            assert_eq!(request.target, b);
            assert_eq!(request.fault, USER_BASE.add(0x1000));

            let phys = t.populate(&b_space, USER_BASE.add(0x1000), &[0; 0x1000]);
            k.invalidate_translations(b).unwrap();
            k.memreq_reply(b, Ok(())).unwrap();
            phys
        };
        assert_eq!(t.kernel.pending_vm_requests(), 0);

        let k = t.kernel.enter(CpuId::BOOT);
        assert_eq!(k.kernel_call_resume(b), Ok(()));
        let caller = k.procs().get(b).unwrap();
        assert!(!caller.misc_flags().contains(MiscFlags::KCALL_RESUME));
        assert!(caller.vm_state().saved.is_none());

        assert_eq!(t.machine.read_phys(b_first, 0x1000), data[..0x1000]);
        assert_eq!(t.machine.read_phys(b_second, 0x1000), data[0x1000..]);
    }

    #[test_log::test]
    fn failed_verdict_ends_the_call() {
        let t = TestKernel::new();
        let (a, a_space) = t.spawn(5);
        t.populate(&a_space, USER_BASE, &[0; 0x1000]);
        let k = t.kernel.enter(CpuId::BOOT);

        let call = KernelCall::Memset {
            target: a,
            addr: USER_BASE,
            byte: 0xff,
            len: 0x2000,
        };
        assert_eq!(k.kernel_call(a, call), Err(Error::VmSuspend));
        assert!(k.memreq_get().is_some());
        k.memreq_reply(a, Err(Error::NoMemory)).unwrap();

        assert_eq!(k.kernel_call_resume(a), Err(Error::NoMemory));
        let caller = k.procs().get(a).unwrap();
        assert!(caller.misc_flags().is_empty());
        assert!(!caller.mem().rts_flags().contains(RtsFlags::VM_REQUEST));
    }

    #[test_log::test]
    fn resumed_call_can_suspend_again() {
        let t = TestKernel::new();
        let (a, a_space) = t.spawn(5);
        t.populate(&a_space, USER_BASE, &[0; 0x1000]);
        let k = t.kernel.enter(CpuId::BOOT);

        let call = KernelCall::Memset {
            target: a,
            addr: USER_BASE,
            byte: 0xff,
            len: 0x2000,
        };
        assert_eq!(k.kernel_call(a, call), Err(Error::VmSuspend));
        assert!(k.memreq_get().is_some());
        // claims success without mapping anything
        k.memreq_reply(a, Ok(())).unwrap();

        assert_eq!(k.kernel_call_resume(a), Err(Error::VmSuspend));
        let caller = k.procs().get(a).unwrap();
        assert!(caller.misc_flags().contains(MiscFlags::KCALL_RESUME));
        assert_eq!(caller.vm_state().saved, Some(call));
        assert_eq!(t.kernel.pending_vm_requests(), 1);
    }

    #[test]
    fn calls_need_permission() {
        let t = TestKernel::new();
        let (a, a_space) = t.spawn_with(5, CallMask::MEMSET);
        t.populate(&a_space, USER_BASE, &[0; 0x1000]);
        let k = t.kernel.enter(CpuId::BOOT);

        let copy = KernelCall::VirCopy {
            src: VirAddr::new(a, USER_BASE),
            dst: VirAddr::new(a, USER_BASE.add(0x800)),
            len: 0x10,
        };
        assert_eq!(k.kernel_call(a, copy), Err(Error::CallDenied));
        assert_eq!(t.kernel.pending_vm_requests(), 0);

        let memset = KernelCall::Memset {
            target: Endpoint::SELF,
            addr: USER_BASE,
            byte: 1,
            len: 0x10,
        };
        assert_eq!(k.kernel_call(a, memset), Ok(()));
        assert_eq!(
            k.kernel_call(Endpoint::new(4, ProcNr(5)), memset),
            Err(Error::NoSuchProcess)
        );
    }

    #[test]
    #[should_panic(expected = "has no kernel call ready to resume")]
    fn resume_without_suspended_call() {
        let t = TestKernel::new();
        let (a, _) = t.spawn(5);
        let k = t.kernel.enter(CpuId::BOOT);
        let _ = k.kernel_call_resume(a);
    }

    #[test_log::test]
    fn exit_forgets_pending_requests() {
        let t = TestKernel::new();
        let (a, a_space) = t.spawn(5);
        t.populate(&a_space, USER_BASE, &[0; 0x1000]);
        let k = t.kernel.enter(CpuId::BOOT);

        let call = KernelCall::Memset {
            target: a,
            addr: USER_BASE.add(0x1000),
            byte: 0,
            len: 1,
        };
        assert_eq!(k.kernel_call(a, call), Err(Error::VmSuspend));
        assert_eq!(t.kernel.pending_vm_requests(), 1);

        k.exit(a).unwrap();
        assert_eq!(t.kernel.pending_vm_requests(), 0);
        assert_eq!(k.memreq_get(), None);
        assert_eq!(k.procs().get(a).unwrap_err(), Error::NoSuchProcess);
    }

    #[test_log::test]
    fn cpus_take_turns() {
        let t = TestKernel::new();
        let (a, a_space) = t.spawn(5);
        let (b, b_space) = t.spawn(6);
        let data = pattern(0x4000, 7);
        t.populate(&a_space, USER_BASE, &data);
        let b_phys = t.populate(&b_space, USER_BASE, &[0; 0x4000 * CPUS]);

        thread::scope(|s| {
            for cpu in 0..CPUS {
                let t = &t;
                s.spawn(move || {
                    let dst = USER_BASE.add(u32::try_from(cpu).unwrap() * 0x4000);
                    for _ in 0..20 {
                        let k = t.kernel.enter(CpuId::new(cpu));
                        let call = KernelCall::VirCopy {
                            src: VirAddr::new(a, USER_BASE),
                            dst: VirAddr::new(b, dst),
                            len: 0x4000,
                        };
                        assert_eq!(k.kernel_call(b, call), Ok(()));
                    }
                });
            }
        });

        for cpu in 0..CPUS {
            let offset = u32::try_from(cpu).unwrap() * 0x4000;
            assert_eq!(t.machine.read_phys(b_phys.add(offset), 0x4000), data);
        }
    }
}
