// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Temporary windows onto foreign memory.
//!
//! The kernel can only access memory that is mapped in the page directory loaded on the
//! CPU it runs on. To reach another process' memory, or physical memory, it points one of
//! the reserved window slots of the loaded directory at the directory entry covering the
//! target address: for a process that is a copy of the process' own directory entry, for
//! physical memory a big page covering the address one-to-one.

use core::ptr;

use crate::arch::{Arch, DirectoryEntry, PagingMode};
use crate::cpu::CpuContext;
use crate::process::Target;
use crate::window_alloc::WindowSlot;
use crate::{PhysicalAddress, VirtualAddress};

/// A range made addressable by [`CpuContext::map_window`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Where the first byte of the requested range is visible in the loaded address space.
    pub addr: VirtualAddress,
    /// How many bytes from `addr` on are covered, at most the requested length.
    pub len: u32,
    /// Whether a directory entry of the loaded page directory was modified, in which case
    /// the translation cache must be reloaded before the window is used.
    pub changed: bool,
}

impl<A: Arch> CpuContext<'_, A> {
    /// Makes `linear` in `target` addressable through window `slot`.
    ///
    /// The loaded page table owner and kernel tasks need no window, their addresses are
    /// returned unchanged.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is not reserved, or if the page table owner or a process target has
    /// no page directory view.
    pub fn map_window(
        &self,
        target: Target<'_>,
        linear: VirtualAddress,
        requested: u32,
        slot: WindowSlot,
    ) -> Window {
        let entry = match target {
            Target::Process(proc) if ptr::eq(proc, self.ptproc()) || proc.is_kernel() => {
                return Window {
                    addr: linear,
                    len: requested,
                    changed: false,
                };
            }
            Target::Process(proc) => {
                let Some(view) = proc.view() else {
                    panic!("{target}: no page directory view to map a window from");
                };
                let offset = A::Mode::dir_entry_offset(A::Mode::dir_index(linear));
                // Safety: `view` maps the process' page directory and `offset` is in bounds
                let raw = unsafe { self.arch().read_word(view.add(offset)) };
                <A::Mode as PagingMode>::DirEntry::from_raw(raw)
            }
            Target::Physical => <A::Mode as PagingMode>::DirEntry::new_big_page(
                PhysicalAddress::new(linear.get()),
                true,
            ),
        };

        let dir_index = self.windows().dir_index(slot);
        let slot_entry = self
            .ptproc_view()
            .add(A::Mode::dir_entry_offset(dir_index));

        // Safety: the view maps the loaded page directory and `dir_index` was reserved for
        // windows, nothing but this code depends on its contents
        let changed = unsafe {
            if self.arch().read_word(slot_entry) == entry.raw() {
                false
            } else {
                self.arch().write_word(slot_entry, entry.raw());
                true
            }
        };

        if changed {
            log::trace!(
                "CPU {}: window {slot:?} -> {target} {} ({entry:?})",
                self.cpu(),
                linear.align_down(A::Mode::WINDOW_SIZE)
            );
        }

        let offset = A::Mode::window_offset(linear);
        Window {
            addr: A::Mode::window_base(dir_index).add(offset),
            len: requested.min(A::Mode::WINDOW_SIZE - offset),
            changed,
        }
    }

    /// Clears every window slot of the loaded page directory, so no window outlives the
    /// address space it was created in.
    ///
    /// The translation cache is not reloaded.
    ///
    /// # Panics
    ///
    /// Panics if the page table owner has no page directory view.
    pub fn clear_windows(&self) {
        let view = self.ptproc_view();
        for dir_index in self.windows().dir_indices() {
            let slot_entry = view.add(A::Mode::dir_entry_offset(dir_index));
            // Safety: see `map_window`
            unsafe {
                self.arch()
                    .write_word(slot_entry, <A::Mode as PagingMode>::DirEntry::VACANT.raw());
            }
        }
    }
}
