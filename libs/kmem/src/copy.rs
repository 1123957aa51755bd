// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::mem;

use crate::arch::{Arch, PagingMode};
use crate::cpu::CpuContext;
use crate::error::{CopyFault, FillFault};
use crate::process::Target;
use crate::window::Window;
use crate::window_alloc::WindowSlot;
use crate::{PhysicalAddress, VirtualAddress};

impl<A: Arch> CpuContext<'_, A> {
    /// Copies `len` bytes from `src_addr` in `src` to `dst_addr` in `dst`.
    ///
    /// The ranges are copied window by window, each chunk as large as both the source and
    /// the destination window allow. A page fault stops the copy and is reported in the
    /// linear address space of the side that faulted; bytes before it have been copied.
    ///
    /// # Errors
    ///
    /// Returns [`CopyFault`] if either side faults, or if a chunk would run off the end of
    /// the address space it is accessed through.
    ///
    /// # Panics
    ///
    /// Panics if either process is being torn down, or if the copy primitive reports a
    /// fault outside of both windows.
    pub fn copy(
        &self,
        src: Target<'_>,
        mut src_addr: VirtualAddress,
        dst: Target<'_>,
        mut dst_addr: VirtualAddress,
        len: u32,
    ) -> Result<(), CopyFault> {
        self.debug_assert_owner_loaded();
        self.assert_copyable(src);
        self.assert_copyable(dst);

        let mut remaining = len;
        while remaining > 0 {
            // both notifications have to be consumed
            let stale = self.take_stale(src) | self.take_stale(dst);

            let src_window = self.map_window(src, src_addr, remaining, WindowSlot::SOURCE);
            let dst_window =
                self.map_window(dst, dst_addr, src_window.len, WindowSlot::DESTINATION);
            if stale || src_window.changed || dst_window.changed {
                self.reload_translations();
            }

            let chunk = dst_window.len;
            if src_window.addr.checked_add(chunk).is_none() {
                return Err(CopyFault::Source(src_addr));
            }
            if dst_window.addr.checked_add(chunk).is_none() {
                return Err(CopyFault::Destination(dst_addr));
            }

            // Safety: both windows map `chunk` bytes of the targets, which the kernel holds no
            // references into. Faults are caught and reported.
            let res = unsafe {
                self.arch()
                    .copy_catch(src_window.addr, dst_window.addr, chunk)
            };
            if let Err(fault) = res {
                if let Some(offset) = fault_offset::<A::Mode>(fault, src_window, chunk) {
                    return Err(CopyFault::Source(src_addr.wrapping_add(offset)));
                }
                if let Some(offset) = fault_offset::<A::Mode>(fault, dst_window, chunk) {
                    return Err(CopyFault::Destination(dst_addr.wrapping_add(offset)));
                }
                panic!(
                    "CPU {}: copy fault at {fault} outside of both windows (source {} and destination {}, {chunk:#x} bytes)",
                    self.cpu(),
                    src_window.addr,
                    dst_window.addr
                );
            }

            remaining -= chunk;
            src_addr = src_addr.wrapping_add(chunk);
            dst_addr = dst_addr.wrapping_add(chunk);
        }

        // a long copy may have raced with the teardown of either side
        self.assert_copyable(src);
        self.assert_copyable(dst);

        Ok(())
    }

    /// Reads `buf.len()` bytes from `addr` in `src` into kernel memory.
    ///
    /// # Errors
    ///
    /// Returns [`CopyFault::Source`] if `src` faults.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is larger than the address space, or if the copy primitive reports a
    /// fault outside of the source window.
    pub fn read(
        &self,
        src: Target<'_>,
        mut addr: VirtualAddress,
        buf: &mut [u8],
    ) -> Result<(), CopyFault> {
        let Ok(mut remaining) = u32::try_from(buf.len()) else {
            panic!("read of {:#x} bytes exceeds the address space", buf.len());
        };
        self.debug_assert_owner_loaded();
        self.assert_copyable(src);

        let mut rest = buf;
        while remaining > 0 {
            let stale = self.take_stale(src);
            let window = self.map_window(src, addr, remaining, WindowSlot::SOURCE);
            if stale || window.changed {
                self.reload_translations();
            }

            let chunk = window.len;
            if window.addr.checked_add(chunk).is_none() {
                return Err(CopyFault::Source(addr));
            }

            let (head, tail) = mem::take(&mut rest).split_at_mut(chunk as usize);
            // Safety: the window maps `chunk` bytes of `src` and `head` is exclusively ours
            if let Err(fault) = unsafe { self.arch().read_catch(window.addr, head) } {
                let Some(offset) = fault_offset::<A::Mode>(fault, window, chunk) else {
                    panic!(
                        "CPU {}: read fault at {fault} outside of window {}",
                        self.cpu(),
                        window.addr
                    );
                };
                return Err(CopyFault::Source(addr.wrapping_add(offset)));
            }

            rest = tail;
            remaining -= chunk;
            addr = addr.wrapping_add(chunk);
        }

        Ok(())
    }

    /// Reads one word of physical memory, such as a page table entry.
    ///
    /// # Panics
    ///
    /// Panics if the word cannot be read, page tables are expected to live in memory.
    pub fn read_phys_u32(&self, phys: PhysicalAddress) -> u32 {
        let mut word = [0; size_of::<u32>()];
        match self.read(Target::Physical, phys.identity(), &mut word) {
            Ok(()) => u32::from_ne_bytes(word),
            Err(fault) => panic!("CPU {}: reading word at {phys}: {fault}", self.cpu()),
        }
    }

    /// Sets `len` bytes from `addr` in `target` to `byte`.
    ///
    /// # Errors
    ///
    /// Returns a [`FillFault`] describing the chunk that faulted and how much was left to
    /// do, so the fill can be resumed from there.
    ///
    /// # Panics
    ///
    /// Panics if the target is being torn down, or if the fill primitive reports a fault
    /// outside of the window.
    pub fn fill(
        &self,
        target: Target<'_>,
        mut addr: VirtualAddress,
        byte: u8,
        len: u32,
    ) -> Result<(), FillFault> {
        self.debug_assert_owner_loaded();
        self.assert_copyable(target);

        let pattern = u32::from_ne_bytes([byte; 4]);
        let mut remaining = len;
        while remaining > 0 {
            let stale = self.take_stale(target);
            let window = self.map_window(target, addr, remaining, WindowSlot::DESTINATION);
            if stale || window.changed {
                self.reload_translations();
            }

            let chunk = window.len;
            if window.addr.checked_add(chunk).is_none() {
                return Err(FillFault {
                    chunk_start: addr,
                    remaining,
                    addr,
                });
            }

            // Safety: the window maps `chunk` bytes of `target`, faults are caught
            if let Err(fault) = unsafe { self.arch().fill_catch(window.addr, pattern, chunk) } {
                let Some(offset) = fault_offset::<A::Mode>(fault, window, chunk) else {
                    panic!(
                        "CPU {}: fill fault at {fault} outside of window {}",
                        self.cpu(),
                        window.addr
                    );
                };
                return Err(FillFault {
                    chunk_start: addr,
                    remaining,
                    addr: addr.wrapping_add(offset),
                });
            }

            remaining -= chunk;
            addr = addr.wrapping_add(chunk);
        }

        self.assert_copyable(target);
        Ok(())
    }
}

/// Offset of `fault` from the start of `window`, if it lies in the `chunk` bytes accessed
/// through it.
///
/// The copy primitives report faults rounded down to [`PagingMode::COPY_GRANULE`], which may
/// land before an unaligned window start. The returned offset then wraps, so adding it to the
/// linear address of the chunk start yields the rounded down address.
fn fault_offset<M: PagingMode>(fault: VirtualAddress, window: Window, chunk: u32) -> Option<u32> {
    let lower = window.addr.align_down(M::COPY_GRANULE);
    let upper = u64::from(window.addr.get()) + u64::from(chunk);
    (fault >= lower && u64::from(fault.get()) < upper)
        .then(|| fault.wrapping_offset_from(window.addr))
}
