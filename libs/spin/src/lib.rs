// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Spinning locks for kernel code that runs with one thread of control per CPU.
//!
//! [`RawClhLock`] is a fair FIFO queue lock where every waiter spins on its own cache line,
//! [`RawSpinLock`] is a plain test-and-set lock. [`KernelLock`] picks one of them at boot
//! and is what serializes entry into the kernel.

#![cfg_attr(not(test), no_std)]

mod backoff;
mod clh;
mod kernel_lock;
mod loom;
mod spinlock;

pub use backoff::Backoff;
pub use clh::{ClhMutex, ClhMutexGuard, RawClhLock};
pub use kernel_lock::{KernelLock, KernelLockGuard, LockKind};
pub use spinlock::{Mutex, MutexGuard, RawSpinLock};

/// Whether unlocking from a CPU that does not hold the lock is caught.
pub(crate) const CHECK_UNLOCK: bool = cfg!(any(debug_assertions, feature = "checked-unlock"));
