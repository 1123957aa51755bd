// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Memory kernel calls.
//!
//! Processes are named by [`Endpoint`]s and live in the [`ProcTable`]. Every CPU enters the
//! kernel through [`Kernel::enter`], which takes the big kernel lock, and then copies
//! ([`InKernel::virtual_copy`]), fills ([`InKernel::vm_memset`]) or translates
//! ([`InKernel::lookup_physical`]) memory of other processes. Page faults in processes are
//! handed to the VM server (see [`vm`]) and the faulting kernel call is restarted once it
//! paged the memory in.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod bootargs;
pub mod config;
mod endpoint;
mod error;
mod kernel;
mod memory;
mod proc;
pub mod vm;

#[cfg(test)]
mod test_utils;

pub use bootargs::Bootargs;
pub use endpoint::Endpoint;
pub use error::Error;
pub use kernel::{BootInfo, InKernel, Kernel, KernelCall, memory_init};
pub use memory::VirAddr;
pub use proc::{CallMask, MiscFlags, Proc, ProcTable};
