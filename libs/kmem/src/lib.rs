// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cross address space memory access for 32-bit two-level paging.
//!
//! The kernel reaches memory of other processes, and physical memory, through a handful of
//! page directory entries (the window slots) that every address space keeps free. See
//! [`CpuContext::map_window`], [`CpuContext::copy`] and [`CpuContext::translate`].

#![cfg_attr(not(any(test, feature = "test_utils")), no_std)]

mod address;
pub mod arch;
mod copy;
mod cpu;
mod error;
mod process;
mod walk;
mod window;
mod window_alloc;

#[cfg(feature = "test_utils")]
pub mod test_utils;

pub use address::{PhysicalAddress, VirtualAddress};
pub use cpu::CpuContext;
pub use error::{CopyFault, FillFault, PageFault, WalkLevel};
pub use process::{ProcNr, ProcessDescriptor, RtsFlags, Target};
pub use walk::Translation;
pub use window::Window;
pub use window_alloc::{MAX_FREE_PDES, WindowSlot, WindowSlots};
