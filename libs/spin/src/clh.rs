// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Craig, Landin and Hagersten queue lock.
//!
//! Waiters form an implicit FIFO queue: each CPU appends one of its own queue nodes to the
//! `tail` and then spins on the node of whoever was the tail before it. The holder releases
//! the lock by clearing the `locked` flag of the node it enqueued, which is observed by at
//! most one successor.
//!
//! Every CPU owns two nodes and alternates between them. A node enqueued by acquisition `n`
//! is only reused by acquisition `n + 2`, and acquisition `n + 1` cannot complete before the
//! successor of acquisition `n` has seen the release, so nobody is still polling a node when
//! it gets reused.
//!
//! The tail holds a tagged word `ticket << NODE_BITS | node id` instead of a pointer. The
//! ticket is per-CPU and advances on every enqueue attempt, which keeps the single
//! compare-and-swap of [`RawClhLock::try_lock`] from succeeding against a node that has
//! been released and re-enqueued in the meantime.

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use kwin_util::{CachePadded, CpuId};

use crate::loom::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use crate::{Backoff, CHECK_UNLOCK};

const NODE_BITS: u32 = 16;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;
/// Node id of the statically allocated node the tail starts out pointing at.
const DUMMY_NODE: u64 = 0;
const NO_OWNER: usize = usize::MAX;

struct Node {
    locked: AtomicBool,
}

impl Node {
    fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }
}

struct CpuNodes {
    nodes: [CachePadded<Node>; 2],
    /// Index into `nodes` that the next acquisition will enqueue.
    next: AtomicU8,
    tickets: AtomicU64,
}

impl CpuNodes {
    fn new() -> Self {
        Self {
            nodes: [CachePadded(Node::new()), CachePadded(Node::new())],
            next: AtomicU8::new(0),
            tickets: AtomicU64::new(0),
        }
    }
}

/// A raw CLH queue lock for up to `CPUS` CPUs.
///
/// Unlike the lock types of `lock_api` the caller names the CPU it is running on. A CPU must
/// not acquire the lock again before it released it, and each CPU must only ever be driven
/// by one thread of control at a time.
pub struct RawClhLock<const CPUS: usize> {
    tail: CachePadded<AtomicU64>,
    owner: AtomicUsize,
    dummy: CachePadded<Node>,
    cpus: [CpuNodes; CPUS],
}

// === impl RawClhLock ===

impl<const CPUS: usize> RawClhLock<CPUS> {
    #[must_use]
    pub fn new() -> Self {
        const {
            assert!(CPUS > 0, "a lock without CPUs is useless");
            assert!(2 * CPUS < (1 << NODE_BITS), "too many CPUs for the node id field");
        }

        Self {
            tail: CachePadded(AtomicU64::new(DUMMY_NODE)),
            owner: AtomicUsize::new(NO_OWNER),
            dummy: CachePadded(Node::new()),
            cpus: core::array::from_fn(|_| CpuNodes::new()),
        }
    }

    /// Acquires the lock on behalf of `cpu`, spinning until every earlier waiter released it.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if `cpu` already holds the lock.
    pub fn lock(&self, cpu: CpuId) {
        debug_assert_ne!(
            self.owner.load(Ordering::Relaxed),
            cpu.get(),
            "CPU {cpu} tried to acquire a CLH lock it already holds"
        );

        let (slot, word, _) = self.prepare(cpu);
        let prev = self.tail.swap(word, Ordering::AcqRel);
        let predecessor = self.node(prev);

        let mut boff = Backoff::new();
        while predecessor.locked.load(Ordering::Acquire) {
            boff.spin();
        }

        self.acquired(cpu, slot);
    }

    /// Tries to acquire the lock without waiting.
    ///
    /// Succeeds only if the lock is free and no other CPU enqueued itself between the check
    /// and the single compare-and-swap on the tail.
    pub fn try_lock(&self, cpu: CpuId) -> bool {
        let tail = self.tail.load(Ordering::Acquire);
        if self.node(tail).locked.load(Ordering::Acquire) {
            return false;
        }

        let (slot, word, node) = self.prepare(cpu);
        if self
            .tail
            .compare_exchange(tail, word, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.acquired(cpu, slot);
            true
        } else {
            // never published, nobody can be watching it
            node.locked.store(false, Ordering::Relaxed);
            false
        }
    }

    /// Releases the lock held by `cpu`, handing it to the next waiter in line.
    ///
    /// # Safety
    ///
    /// `cpu` must hold the lock.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` does not hold the lock. This is checked in debug builds and when the
    /// `checked-unlock` feature is enabled.
    pub unsafe fn unlock(&self, cpu: CpuId) {
        if CHECK_UNLOCK {
            let owner = self.owner.load(Ordering::Relaxed);
            assert!(
                owner == cpu.get(),
                "CPU {cpu} released a CLH lock held by another CPU (owner {owner:#x})"
            );
        }

        self.owner.store(NO_OWNER, Ordering::Relaxed);

        let nodes = &self.cpus[cpu.get()];
        let held = usize::from(nodes.next.load(Ordering::Relaxed) ^ 1);
        nodes.nodes[held].locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.node(self.tail.load(Ordering::Acquire))
            .locked
            .load(Ordering::Acquire)
    }

    /// The CPU currently holding the lock, if any.
    pub fn owner(&self) -> Option<CpuId> {
        match self.owner.load(Ordering::Relaxed) {
            NO_OWNER => None,
            cpu => Some(CpuId::new(cpu)),
        }
    }

    /// The CPU whose node is the tail of the queue, i.e. the last CPU to have enqueued
    /// itself. `None` while the tail still is the initial dummy node.
    pub fn last_enqueued(&self) -> Option<CpuId> {
        let id = Self::node_index(self.tail.load(Ordering::Acquire))?;
        Some(CpuId::new(id / 2))
    }

    /// Marks the next node of `cpu` as locked and builds its tagged tail word.
    fn prepare(&self, cpu: CpuId) -> (u8, u64, &Node) {
        let nodes = &self.cpus[cpu.get()];
        let slot = nodes.next.load(Ordering::Relaxed);
        let node = &nodes.nodes[usize::from(slot)];

        let ticket = nodes.tickets.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let id = 1 + cpu.get() as u64 * 2 + u64::from(slot);

        node.locked.store(true, Ordering::Relaxed);

        (slot, (ticket << NODE_BITS) | id, node)
    }

    fn acquired(&self, cpu: CpuId, slot: u8) {
        self.owner.store(cpu.get(), Ordering::Relaxed);
        self.cpus[cpu.get()]
            .next
            .store(slot ^ 1, Ordering::Relaxed);
    }

    /// Per-CPU node index encoded in a tail word, `None` for the dummy.
    #[expect(clippy::cast_possible_truncation, reason = "masked to NODE_BITS")]
    fn node_index(word: u64) -> Option<usize> {
        match word & NODE_MASK {
            DUMMY_NODE => None,
            id => Some((id - 1) as usize),
        }
    }

    fn node(&self, word: u64) -> &Node {
        match Self::node_index(word) {
            None => &self.dummy,
            Some(id) => &self.cpus[id / 2].nodes[id % 2],
        }
    }
}

impl<const CPUS: usize> Default for RawClhLock<CPUS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CPUS: usize> fmt::Debug for RawClhLock<CPUS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawClhLock")
            .field("locked", &self.is_locked())
            .field("owner", &self.owner())
            .field("last_enqueued", &self.last_enqueued())
            .finish_non_exhaustive()
    }
}

/// Data protected by a [`RawClhLock`].
pub struct ClhMutex<T, const CPUS: usize> {
    raw: RawClhLock<CPUS>,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by `raw`
unsafe impl<T: Send, const CPUS: usize> Sync for ClhMutex<T, CPUS> {}

pub struct ClhMutexGuard<'a, T, const CPUS: usize> {
    mutex: &'a ClhMutex<T, CPUS>,
    cpu: CpuId,
    // the lock is released on the CPU that took it
    _not_send: PhantomData<*mut ()>,
}

impl<T, const CPUS: usize> ClhMutex<T, CPUS> {
    pub fn new(data: T) -> Self {
        Self {
            raw: RawClhLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self, cpu: CpuId) -> ClhMutexGuard<'_, T, CPUS> {
        self.raw.lock(cpu);
        ClhMutexGuard {
            mutex: self,
            cpu,
            _not_send: PhantomData,
        }
    }

    pub fn try_lock(&self, cpu: CpuId) -> Option<ClhMutexGuard<'_, T, CPUS>> {
        self.raw.try_lock(cpu).then(|| ClhMutexGuard {
            mutex: self,
            cpu,
            _not_send: PhantomData,
        })
    }

    pub fn raw(&self) -> &RawClhLock<CPUS> {
        &self.raw
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T, const CPUS: usize> Deref for ClhMutexGuard<'_, T, CPUS> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves we hold the lock
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T, const CPUS: usize> DerefMut for ClhMutexGuard<'_, T, CPUS> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves we hold the lock
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T, const CPUS: usize> Drop for ClhMutexGuard<'_, T, CPUS> {
    fn drop(&mut self) {
        // Safety: the guard was created by a successful acquisition on `self.cpu`
        unsafe { self.mutex.raw.unlock(self.cpu) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom::sync::Arc;
    use crate::loom::{model, thread};

    #[cfg(not(loom))]
    #[test]
    fn smoke() {
        let lock = RawClhLock::<2>::new();
        let cpu0 = CpuId::new(0);

        for _ in 0..5 {
            lock.lock(cpu0);
            assert!(lock.is_locked());
            assert_eq!(lock.owner(), Some(cpu0));
            unsafe { lock.unlock(cpu0) };
            assert!(!lock.is_locked());
            assert_eq!(lock.owner(), None);
        }

        lock.lock(CpuId::new(1));
        assert_eq!(lock.last_enqueued(), Some(CpuId::new(1)));
        unsafe { lock.unlock(CpuId::new(1)) };
    }

    #[cfg(not(loom))]
    #[test]
    fn try_lock_fails_while_held() {
        let lock = RawClhLock::<2>::new();
        let (cpu0, cpu1) = (CpuId::new(0), CpuId::new(1));

        assert!(lock.try_lock(cpu0));
        assert!(!lock.try_lock(cpu1));
        assert_eq!(lock.owner(), Some(cpu0));

        unsafe { lock.unlock(cpu0) };
        assert!(lock.try_lock(cpu1));
        assert_eq!(lock.owner(), Some(cpu1));
        unsafe { lock.unlock(cpu1) };

        // failed attempts must not leave a node marked as locked behind
        assert!(!lock.is_locked());
        lock.lock(cpu0);
        unsafe { lock.unlock(cpu0) };
    }

    #[cfg(not(loom))]
    #[test]
    fn blocked_try_lock_then_lock_after_release() {
        let lock = Arc::new(RawClhLock::<2>::new());
        let (cpu0, cpu1) = (CpuId::new(0), CpuId::new(1));

        lock.lock(cpu0);
        let other = {
            let lock = lock.clone();
            thread::spawn(move || lock.try_lock(cpu1))
        };
        assert!(!other.join().unwrap());
        assert_eq!(lock.owner(), Some(cpu0));

        unsafe { lock.unlock(cpu0) };
        let other = {
            let lock = lock.clone();
            thread::spawn(move || {
                lock.lock(cpu1);
                lock.owner()
            })
        };
        assert_eq!(other.join().unwrap(), Some(cpu1));
        unsafe { lock.unlock(cpu1) };
        assert!(!lock.is_locked());
    }

    #[cfg(not(loom))]
    #[test]
    fn mixed_try_lock_and_lock_alternate_nodes() {
        let lock = RawClhLock::<1>::new();
        let cpu = CpuId::new(0);

        for i in 0..16 {
            if i % 3 == 0 {
                assert!(lock.try_lock(cpu));
            } else {
                lock.lock(cpu);
            }
            unsafe { lock.unlock(cpu) };
        }
        assert!(!lock.is_locked());
    }

    #[cfg(not(loom))]
    #[test]
    fn mutex_guard() {
        let mutex = ClhMutex::<_, 2>::new(0_u32);
        {
            let mut guard = mutex.lock(CpuId::new(0));
            *guard += 1;
            assert!(mutex.try_lock(CpuId::new(1)).is_none());
        }
        *mutex.try_lock(CpuId::new(1)).unwrap() += 1;
        assert_eq!(mutex.into_inner(), 2);
    }

    #[test]
    fn mutual_exclusion() {
        model(|| {
            let lock = Arc::new(RawClhLock::<2>::new());
            let counter = Arc::new(AtomicUsize::new(0));

            let threads: Vec<_> = (0..2)
                .map(|cpu| {
                    let lock = lock.clone();
                    let counter = counter.clone();
                    thread::spawn(move || {
                        let cpu = CpuId::new(cpu);
                        lock.lock(cpu);
                        // split read-modify-write, only correct under mutual exclusion
                        let seen = counter.load(Ordering::Relaxed);
                        thread::yield_now();
                        counter.store(seen + 1, Ordering::Relaxed);
                        unsafe { lock.unlock(cpu) };
                    })
                })
                .collect();

            for t in threads {
                t.join().unwrap();
            }

            assert_eq!(counter.load(Ordering::Relaxed), 2);
            assert!(!lock.is_locked());
        });
    }

    #[cfg(not(loom))]
    #[test]
    fn never_two_holders_under_contention() {
        const CPUS: usize = 4;
        const ROUNDS: usize = 500;

        let mutex = Arc::new(ClhMutex::<_, CPUS>::new(0_usize));
        let inside = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let monitor = {
            let inside = inside.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut max_seen = 0;
                while !done.load(Ordering::Acquire) {
                    max_seen = max_seen.max(inside.load(Ordering::SeqCst));
                    thread::yield_now();
                }
                max_seen
            })
        };

        let threads: Vec<_> = (0..CPUS)
            .map(|cpu| {
                let mutex = mutex.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    let cpu = CpuId::new(cpu);
                    for _ in 0..ROUNDS {
                        let mut guard = mutex.lock(cpu);
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        *guard += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }
        done.store(true, Ordering::Release);

        assert!(monitor.join().unwrap() <= 1);
        assert_eq!(*mutex.lock(CpuId::new(0)), CPUS * ROUNDS);
    }

    #[cfg(not(loom))]
    #[test]
    fn waiters_are_served_in_arrival_order() {
        use std::sync::Mutex;

        let lock = Arc::new(RawClhLock::<3>::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        lock.lock(CpuId::new(0));

        let mut threads = Vec::new();
        for cpu in 1..3 {
            let waiter = lock.clone();
            let order = order.clone();
            threads.push(thread::spawn(move || {
                let cpu = CpuId::new(cpu);
                waiter.lock(cpu);
                order.lock().unwrap().push(cpu.get());
                unsafe { waiter.unlock(cpu) };
            }));

            // wait until this waiter is in the queue before the next one arrives
            while lock.last_enqueued() != Some(CpuId::new(cpu)) {
                thread::yield_now();
            }
        }

        unsafe { lock.unlock(CpuId::new(0)) };
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), [1, 2]);
    }

    #[cfg(all(not(loom), any(debug_assertions, feature = "checked-unlock")))]
    #[test]
    #[should_panic(expected = "held by another CPU")]
    fn unlock_by_non_owner() {
        let lock = RawClhLock::<2>::new();
        lock.lock(CpuId::new(0));
        unsafe { lock.unlock(CpuId::new(1)) };
    }

    #[cfg(all(not(loom), debug_assertions))]
    #[test]
    #[should_panic(expected = "already holds")]
    fn recursive_acquisition() {
        let lock = RawClhLock::<1>::new();
        lock.lock(CpuId::new(0));
        lock.lock(CpuId::new(0));
    }
}
