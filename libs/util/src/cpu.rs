// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// The largest number of CPUs a [`CpuSet`] can track.
pub const MAX_CPUS: usize = 64;

/// Logical id of a CPU, dense and starting at zero.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CpuId(usize);

impl CpuId {
    pub const BOOT: Self = Self(0);

    /// # Panics
    ///
    /// Panics if `inner` is not below [`MAX_CPUS`].
    #[must_use]
    pub const fn new(inner: usize) -> Self {
        assert!(inner < MAX_CPUS, "logical cpu id out of range");
        Self(inner)
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }

    const fn mask(self) -> u64 {
        1 << self.0
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[logical cpu #{}]", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A set of CPUs that can be updated concurrently.
///
/// Used for per-CPU "your cached translations are stale" notifications: the writer of a
/// page table marks every CPU, and each CPU atomically consumes its own bit before it
/// next trusts its translation cache.
#[derive(Default)]
pub struct CpuSet(AtomicU64);

impl CpuSet {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn insert_all(&self) {
        self.0.store(u64::MAX, Ordering::Release);
    }

    /// Atomically clears `cpu`, returning whether it was set.
    pub fn take(&self, cpu: CpuId) -> bool {
        self.0.fetch_and(!cpu.mask(), Ordering::AcqRel) & cpu.mask() != 0
    }

    pub fn contains(&self, cpu: CpuId) -> bool {
        self.0.load(Ordering::Acquire) & cpu.mask() != 0
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = self.0.load(Ordering::Relaxed);
        f.debug_set()
            .entries((0..MAX_CPUS).filter(|i| bits & (1 << i) != 0).map(CpuId))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_consumes_only_own_bit() {
        let set = CpuSet::new();
        assert!(!set.contains(CpuId::new(1)));
        set.insert_all();

        assert!(set.take(CpuId::new(1)));
        assert!(!set.take(CpuId::new(1)));
        assert!(!set.contains(CpuId::new(1)));
        assert!(set.contains(CpuId::new(0)));
        assert!(set.contains(CpuId::new(63)));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn id_out_of_range() {
        let _ = CpuId::new(MAX_CPUS);
    }
}
