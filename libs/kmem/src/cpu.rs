// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use kwin_util::CpuId;

use crate::arch::Arch;
use crate::process::{ProcessDescriptor, Target};
use crate::VirtualAddress;
use crate::window_alloc::WindowSlots;

/// The state of one CPU that cross-address-space memory access depends on.
///
/// `ptproc` is the process whose page directory is loaded on this CPU; window entries are
/// written into that directory through its view.
pub struct CpuContext<'a, A: Arch> {
    cpu: CpuId,
    arch: &'a A,
    windows: &'a WindowSlots<A::Mode>,
    ptproc: &'a ProcessDescriptor,
}

impl<'a, A: Arch> CpuContext<'a, A> {
    pub fn new(
        cpu: CpuId,
        arch: &'a A,
        windows: &'a WindowSlots<A::Mode>,
        ptproc: &'a ProcessDescriptor,
    ) -> Self {
        Self {
            cpu,
            arch,
            windows,
            ptproc,
        }
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn arch(&self) -> &'a A {
        self.arch
    }

    pub fn windows(&self) -> &'a WindowSlots<A::Mode> {
        self.windows
    }

    pub fn ptproc(&self) -> &'a ProcessDescriptor {
        self.ptproc
    }

    /// View of the page directory loaded on this CPU.
    pub(crate) fn ptproc_view(&self) -> VirtualAddress {
        match self.ptproc.view() {
            Some(view) => view,
            None => panic!(
                "CPU {}: page table owner {} has no page directory view",
                self.cpu,
                self.ptproc.nr()
            ),
        }
    }

    /// Consumes this CPU's stale-translation notification for `target`.
    pub(crate) fn take_stale(&self, target: Target<'_>) -> bool {
        target
            .process()
            .is_some_and(|proc| proc.take_stale(self.cpu))
    }

    pub(crate) fn reload_translations(&self) {
        log::trace!("CPU {}: reloading translations", self.cpu);
        self.arch.reload_translations();
    }

    /// Asserts `proc` is not being torn down or rebuilt, both of which would pull its page
    /// tables out from under a window.
    pub(crate) fn assert_copyable(&self, target: Target<'_>) {
        if let Some(proc) = target.process() {
            assert!(
                proc.is_copyable(),
                "CPU {}: {target} is not copyable ({:?})",
                self.cpu,
                proc.rts_flags()
            );
        }
    }

    pub(crate) fn debug_assert_owner_loaded(&self) {
        debug_assert_eq!(
            self.arch.active_root(),
            self.ptproc.root(),
            "CPU {}: loaded page directory does not belong to process {}",
            self.cpu,
            self.ptproc.nr()
        );
    }
}

impl<A: Arch> fmt::Debug for CpuContext<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuContext")
            .field("cpu", &self.cpu)
            .field("windows", &self.windows)
            .field("ptproc", &self.ptproc)
            .finish_non_exhaustive()
    }
}
