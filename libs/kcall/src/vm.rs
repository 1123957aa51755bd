// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The kernel side of the memory request protocol with the VM server.
//!
//! A kernel call that hits a page fault it cannot resolve itself suspends its caller with
//! [`InKernel::vm_suspend`] and returns [`Error::VmSuspend`]. The VM server collects the
//! request with [`InKernel::memreq_get`], makes the range accessible (or fails to) and
//! reports back with [`InKernel::memreq_reply`], after which the call is restarted through
//! [`InKernel::kernel_call_resume`].

use alloc::collections::VecDeque;

use kmem::arch::Arch;
use kmem::{RtsFlags, VirtualAddress};
use kwin_spin::Mutex;

use crate::kernel::{InKernel, KernelCall};
use crate::proc::{MiscFlags, Proc};
use crate::{Endpoint, Error};

/// Why a process waits for the VM server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// A kernel call made by the process faulted.
    KernelCall,
}

/// A range the VM server is asked to make accessible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRequest {
    pub requestor: Endpoint,
    pub target: Endpoint,
    pub start: VirtualAddress,
    pub len: u32,
    pub write: bool,
    /// The address the kernel actually faulted on, within the range.
    pub fault: VirtualAddress,
    pub kind: RequestKind,
}

/// Per-process state of the memory request protocol.
#[derive(Debug)]
pub(crate) struct VmState {
    pub(crate) request: Option<MemRequest>,
    /// The VM server's verdict on the last request. [`Error::VmSuspend`] while the request
    /// is being worked on.
    pub(crate) vmresult: Result<(), Error>,
    /// The kernel call to restart once the request is answered.
    pub(crate) saved: Option<KernelCall>,
}

impl VmState {
    pub(crate) const fn new() -> Self {
        Self {
            request: None,
            vmresult: Ok(()),
            saved: None,
        }
    }
}

/// Processes waiting for the VM server to pick up their request, oldest first.
#[derive(Debug)]
pub(crate) struct VmQueue(Mutex<VecDeque<Endpoint>>);

impl VmQueue {
    pub(crate) const fn new() -> Self {
        Self(Mutex::new(VecDeque::new()))
    }

    pub(crate) fn remove(&self, endpoint: Endpoint) {
        self.0.lock().retain(|e| *e != endpoint);
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().len()
    }
}

impl<A: Arch> InKernel<'_, A> {
    /// Suspends `caller` until the VM server made `[start, start + len)` of `target`
    /// accessible, for writing if `write` is set.
    ///
    /// # Panics
    ///
    /// Panics if `caller` or `target` already wait for the VM server.
    pub(crate) fn vm_suspend(
        &self,
        caller: &Proc,
        target: &Proc,
        start: VirtualAddress,
        len: u32,
        write: bool,
        fault: VirtualAddress,
    ) {
        assert!(
            !caller.mem().rts_flags().contains(RtsFlags::VM_REQUEST),
            "process {} already waits for the VM server",
            caller.nr()
        );
        assert!(
            !target.mem().rts_flags().contains(RtsFlags::VM_REQUEST),
            "target process {} waits for the VM server",
            target.nr()
        );

        let request = MemRequest {
            requestor: caller.endpoint(),
            target: target.endpoint(),
            start,
            len,
            write,
            fault,
            kind: RequestKind::KernelCall,
        };
        log::debug!("CPU {}: suspending {request:?}", self.cpu());

        caller.mem().set_rts_flags(RtsFlags::VM_REQUEST);
        caller.vm_state().request = Some(request);

        let mut queue = self.vm_queue().0.lock();
        if queue.is_empty() {
            log::trace!("notifying VM server of pending memory requests");
        }
        queue.push_back(request.requestor);
    }

    /// Hands the oldest pending request to the VM server, or `None` if nothing waits.
    ///
    /// # Panics
    ///
    /// Panics if a queued process has no request.
    pub fn memreq_get(&self) -> Option<MemRequest> {
        loop {
            let requestor = self.vm_queue().0.lock().pop_front()?;
            let Ok(proc) = self.procs().get(requestor) else {
                log::warn!("memreq_get: requestor {requestor} is gone");
                continue;
            };

            assert!(
                proc.mem().rts_flags().contains(RtsFlags::VM_REQUEST),
                "queued process {} is not waiting for the VM server",
                proc.nr()
            );
            let mut state = proc.vm_state();
            let Some(request) = state.request else {
                panic!("queued process {} has no memory request", proc.nr());
            };
            state.vmresult = Err(Error::VmSuspend);
            return Some(request);
        }
    }

    /// Delivers the VM server's `verdict` on the request of `requestor` and marks its
    /// suspended kernel call for restart.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchProcess`] if `requestor` is not live and
    /// [`Error::InvalidArgument`] if it has no request handed out by [`Self::memreq_get`]
    /// or if `verdict` is itself a suspension.
    pub fn memreq_reply(&self, requestor: Endpoint, verdict: Result<(), Error>) -> Result<(), Error> {
        let proc = self.procs().get(requestor)?;
        if verdict == Err(Error::VmSuspend) {
            return Err(Error::InvalidArgument);
        }

        let mut state = proc.vm_state();
        if !proc.mem().rts_flags().contains(RtsFlags::VM_REQUEST)
            || state.vmresult != Err(Error::VmSuspend)
        {
            log::warn!("memreq_reply: process {} has no outstanding request", proc.nr());
            return Err(Error::InvalidArgument);
        }

        log::debug!("VM server answered {:?} with {verdict:?}", state.request);
        state.vmresult = verdict;
        state.request = None;
        drop(state);

        proc.set_misc_flags(MiscFlags::KCALL_RESUME);
        proc.mem().clear_rts_flags(RtsFlags::VM_REQUEST);
        Ok(())
    }
}
