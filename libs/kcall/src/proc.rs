// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use core::fmt;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use bitflags::bitflags;
use kmem::{ProcNr, ProcessDescriptor, RtsFlags};
use kwin_spin::{Mutex, MutexGuard};

use crate::config::{NR_PROCS, NR_TASKS};
use crate::vm::VmState;
use crate::{Endpoint, Error};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MiscFlags: u32 {
        /// A kernel call of this process was suspended and is restarted once the VM server
        /// replied. While set, the VM server's verdict decides the outcome of the retry.
        const KCALL_RESUME = 1 << 0;
    }
}

bitflags! {
    /// Kernel calls a process is allowed to make.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CallMask: u32 {
        const VIRCOPY = 1 << 0;
        const MEMSET = 1 << 1;
    }
}

/// A process table slot.
pub struct Proc {
    mem: ProcessDescriptor,
    endpoint: AtomicI32,
    misc: AtomicU32,
    calls: AtomicU32,
    vm: Mutex<VmState>,
}

impl Proc {
    fn new(nr: ProcNr) -> Self {
        let mem = ProcessDescriptor::new(nr);
        if !nr.is_kernel() {
            mem.set_rts_flags(RtsFlags::SLOT_FREE);
        }

        Self {
            mem,
            endpoint: AtomicI32::new(Endpoint::new(0, nr).raw()),
            misc: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            vm: Mutex::new(VmState::new()),
        }
    }

    /// The memory-management view of this process.
    pub fn mem(&self) -> &ProcessDescriptor {
        &self.mem
    }

    pub fn nr(&self) -> ProcNr {
        self.mem.nr()
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::from_raw(self.endpoint.load(Ordering::Acquire))
    }

    pub fn is_free(&self) -> bool {
        self.mem.rts_flags().contains(RtsFlags::SLOT_FREE)
    }

    pub fn misc_flags(&self) -> MiscFlags {
        MiscFlags::from_bits_retain(self.misc.load(Ordering::Acquire))
    }

    pub fn set_misc_flags(&self, flags: MiscFlags) {
        self.misc.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_misc_flags(&self, flags: MiscFlags) {
        self.misc.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn may_call(&self, calls: CallMask) -> bool {
        CallMask::from_bits_retain(self.calls.load(Ordering::Acquire)).contains(calls)
    }

    pub(crate) fn vm_state(&self) -> MutexGuard<'_, VmState> {
        self.vm.lock()
    }
}

impl fmt::Debug for Proc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proc")
            .field("endpoint", &self.endpoint())
            .field("mem", &self.mem)
            .field("misc", &self.misc_flags())
            .field("calls", &CallMask::from_bits_retain(self.calls.load(Ordering::Relaxed)))
            .field("vm", &*self.vm.lock())
            .finish()
    }
}

/// All process table slots: kernel tasks first, then processes.
///
/// Slots never move, so references handed out stay valid for the lifetime of the table;
/// whether they still name the same process is what endpoints are for.
pub struct ProcTable {
    procs: Box<[Proc]>,
}

impl ProcTable {
    /// A table with the kernel tasks running and every process slot free.
    pub fn new() -> Self {
        Self {
            procs: (-NR_TASKS..NR_PROCS).map(|nr| Proc::new(ProcNr(nr))).collect(),
        }
    }

    /// The slot `nr`, whether in use or not.
    pub fn by_nr(&self, nr: ProcNr) -> Option<&Proc> {
        let index = usize::try_from(nr.0.checked_add(NR_TASKS)?).ok()?;
        self.procs.get(index)
    }

    /// Resolves `endpoint` to a live process.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchProcess`] if the slot is out of range or free, or if the
    /// endpoint is left over from an earlier process in the slot.
    pub fn get(&self, endpoint: Endpoint) -> Result<&Proc, Error> {
        match self.by_nr(endpoint.proc_nr()) {
            Some(proc) if !proc.is_free() && proc.endpoint() == endpoint => Ok(proc),
            _ => Err(Error::NoSuchProcess),
        }
    }

    /// Starts a process in the free slot `nr` with a fresh endpoint and no address space.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `nr` is a kernel task, out of range or in use.
    pub fn spawn(&self, nr: ProcNr, calls: CallMask) -> Result<Endpoint, Error> {
        let proc = self
            .by_nr(nr)
            .filter(|proc| !nr.is_kernel() && proc.is_free())
            .ok_or(Error::InvalidArgument)?;

        let endpoint = proc.endpoint().next_generation();
        proc.endpoint.store(endpoint.raw(), Ordering::Release);
        proc.calls.store(calls.bits(), Ordering::Release);
        proc.misc.store(0, Ordering::Release);
        *proc.vm.lock() = VmState::new();
        proc.mem.clear_address_space();
        proc.mem.clear_rts_flags(RtsFlags::all());

        log::debug!("process {nr}: spawned as endpoint {endpoint}");
        Ok(endpoint)
    }

    /// Frees the slot of `proc`.
    pub(crate) fn free(&self, proc: &Proc) {
        proc.mem.set_rts_flags(RtsFlags::SLOT_FREE);
        proc.mem.release_address_space();
        log::debug!("process {}: exited", proc.nr());
    }

    pub fn iter(&self) -> impl Iterator<Item = &Proc> + '_ {
        self.procs.iter()
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProcTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.procs.iter().filter(|proc| !proc.is_free()))
            .finish()
    }
}
