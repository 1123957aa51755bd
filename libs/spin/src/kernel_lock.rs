// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::marker::PhantomData;
use core::str::FromStr;
use core::sync::atomic::{AtomicUsize, Ordering};

use kwin_util::CpuId;
use lock_api::RawMutex as _;

use crate::{CHECK_UNLOCK, RawClhLock, RawSpinLock};

const NO_OWNER: usize = usize::MAX;

/// Lock implementation backing the [`KernelLock`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Fair FIFO queue lock, every waiter spins on its own cache line.
    #[default]
    Clh,
    /// Test-and-set lock.
    Spinlock,
}

impl FromStr for LockKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clh" => Ok(Self::Clh),
            "spinlock" => Ok(Self::Spinlock),
            _ => anyhow::bail!("unknown lock implementation `{s}`, expected `clh` or `spinlock`"),
        }
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Clh => "clh",
            Self::Spinlock => "spinlock",
        })
    }
}

/// The big kernel lock: serializes all CPUs entering the kernel.
///
/// The implementation is picked once at boot and fixed for the lifetime of the lock.
pub struct KernelLock<const CPUS: usize> {
    inner: Inner<CPUS>,
}

enum Inner<const CPUS: usize> {
    Clh(RawClhLock<CPUS>),
    Spin { raw: RawSpinLock, owner: AtomicUsize },
}

impl<const CPUS: usize> KernelLock<CPUS> {
    pub fn new(kind: LockKind) -> Self {
        log::info!("big kernel lock implementation: {kind}");

        let inner = match kind {
            LockKind::Clh => Inner::Clh(RawClhLock::new()),
            LockKind::Spinlock => Inner::Spin {
                raw: RawSpinLock::new(),
                owner: AtomicUsize::new(NO_OWNER),
            },
        };
        Self { inner }
    }

    pub fn kind(&self) -> LockKind {
        match self.inner {
            Inner::Clh(_) => LockKind::Clh,
            Inner::Spin { .. } => LockKind::Spinlock,
        }
    }

    pub fn lock(&self, cpu: CpuId) {
        match &self.inner {
            Inner::Clh(raw) => raw.lock(cpu),
            Inner::Spin { raw, owner } => {
                raw.lock();
                owner.store(cpu.get(), Ordering::Relaxed);
            }
        }
    }

    pub fn try_lock(&self, cpu: CpuId) -> bool {
        match &self.inner {
            Inner::Clh(raw) => raw.try_lock(cpu),
            Inner::Spin { raw, owner } => {
                let locked = raw.try_lock();
                if locked {
                    owner.store(cpu.get(), Ordering::Relaxed);
                }
                locked
            }
        }
    }

    /// # Safety
    ///
    /// `cpu` must hold the lock.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` does not hold the lock, see [`RawClhLock::unlock`].
    pub unsafe fn unlock(&self, cpu: CpuId) {
        match &self.inner {
            // Safety: ensured by caller
            Inner::Clh(raw) => unsafe { raw.unlock(cpu) },
            Inner::Spin { raw, owner } => {
                let prev = owner.swap(NO_OWNER, Ordering::Relaxed);
                if CHECK_UNLOCK {
                    assert!(
                        prev == cpu.get(),
                        "CPU {cpu} released the kernel lock held by another CPU (owner {prev:#x})"
                    );
                }
                // Safety: ensured by caller
                unsafe { raw.unlock() };
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        match &self.inner {
            Inner::Clh(raw) => raw.is_locked(),
            Inner::Spin { raw, .. } => raw.is_locked(),
        }
    }

    pub fn owner(&self) -> Option<CpuId> {
        match &self.inner {
            Inner::Clh(raw) => raw.owner(),
            Inner::Spin { owner, .. } => match owner.load(Ordering::Relaxed) {
                NO_OWNER => None,
                cpu => Some(CpuId::new(cpu)),
            },
        }
    }

    /// Enters the kernel on `cpu`, leaving it again when the guard is dropped.
    pub fn enter(&self, cpu: CpuId) -> KernelLockGuard<'_, CPUS> {
        self.lock(cpu);
        KernelLockGuard {
            lock: self,
            cpu,
            _not_send: PhantomData,
        }
    }
}

impl<const CPUS: usize> fmt::Debug for KernelLock<CPUS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelLock")
            .field("kind", &self.kind())
            .field("owner", &self.owner())
            .finish_non_exhaustive()
    }
}

#[must_use = "the kernel lock is released as soon as the guard is dropped"]
pub struct KernelLockGuard<'a, const CPUS: usize> {
    lock: &'a KernelLock<CPUS>,
    cpu: CpuId,
    _not_send: PhantomData<*mut ()>,
}

impl<const CPUS: usize> KernelLockGuard<'_, CPUS> {
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }
}

impl<const CPUS: usize> Drop for KernelLockGuard<'_, CPUS> {
    fn drop(&mut self) {
        // Safety: the guard only exists while `self.cpu` holds the lock
        unsafe { self.lock.unlock(self.cpu) }
    }
}
