// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::Backoff;

pub type Mutex<T> = lock_api::Mutex<RawSpinLock, T>;
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;

/// Test-and-test-and-set spinlock.
///
/// Cheaper than [`RawClhLock`](crate::RawClhLock) when uncontended but unfair: every waiter
/// hammers the same cache line and whoever wins the race gets the lock.
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: `locked` is only set by a successful acquire and cleared by `unlock`, giving
// mutual exclusion; Acquire/Release orders the critical sections.
unsafe impl lock_api::RawMutex for RawSpinLock {
    type GuardMarker = lock_api::GuardSend;

    #[expect(clippy::declare_interior_mutable_const, reason = "required by lock_api")]
    const INIT: Self = Self::new();

    fn lock(&self) {
        let mut boff = Backoff::default();
        while !self.try_acquire() {
            // spin on a plain load so waiters share the line until it is released
            while self.is_locked() {
                boff.spin();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.try_acquire()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn try_lock() {
        let mutex = Mutex::new(42);

        let a = mutex.try_lock();
        assert_eq!(a.as_deref(), Some(&42));
        assert!(mutex.try_lock().is_none());

        drop(a);
        assert_eq!(mutex.try_lock().as_deref(), Some(&42));
    }

    #[test]
    fn contended_counter() {
        let mutex = Arc::new(Mutex::new(0_u32));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let mutex = mutex.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(*mutex.lock(), 4000);
    }
}
