//! Ticket spinlock.
//!
//! Two counters: `allocated` hands out tickets, `current` admits them in
//! order, so contending CPUs enter in FIFO order. The guard form disables
//! interrupts for the hold duration; the raw form exposes `grab`/`ungrab`
//! for the scheduler's park-and-release handoff, where the lock is released
//! by a different code path than the one that acquired it.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch;

pub struct RawTicketLock {
    current: AtomicUsize,
    allocated: AtomicUsize,
}

impl RawTicketLock {
    pub const fn new() -> Self {
        RawTicketLock {
            current: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Acquire without touching the interrupt level.
    pub fn grab(&self) {
        let ticket = self.allocated.fetch_add(1, Ordering::Relaxed);
        #[cfg(debug_assertions)]
        {
            let mut tries = crate::config::SPIN_DEADLOCK_TRIES;
            while self.current.load(Ordering::Acquire) != ticket {
                arch::cpu_relax();
                tries -= 1;
                if tries == 0 {
                    panic!("spinlock: suspected deadlock or severe contention");
                }
            }
        }
        #[cfg(not(debug_assertions))]
        while self.current.load(Ordering::Acquire) != ticket {
            arch::cpu_relax();
        }
    }

    /// Release. Admits the next ticket in line.
    pub fn ungrab(&self) {
        let current = self.current.load(Ordering::Relaxed);
        self.current.store(current + 1, Ordering::Release);
    }
}

impl Default for RawTicketLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Ticket lock plus the data it guards. `lock` raises the interrupt level
/// before taking a ticket and restores it when the guard drops.
pub struct SpinLock<T: ?Sized> {
    raw: RawTicketLock,
    data: UnsafeCell<T>,
}

// SAFETY: access to the data happens only through the guard.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        SpinLock {
            raw: RawTicketLock::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinGuard<'_, T> {
        let int_state = arch::interrupts_disable();
        self.raw.grab();
        SpinGuard {
            lock: self,
            int_state,
        }
    }

    /// The underlying ticket lock, for handing to
    /// `localsched::suspend_current` as the park-release target.
    pub fn raw(&self) -> &RawTicketLock {
        &self.raw
    }
}

pub struct SpinGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    int_state: bool,
}

impl<T: ?Sized> Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.ungrab();
        arch::interrupts_restore(self.int_state);
    }
}

impl<'a, T: ?Sized> SpinGuard<'a, T> {
    /// Give up the guard while *keeping the lock held*, returning the saved
    /// interrupt state. The caller must arrange for `ungrab` to run (in
    /// practice by passing the raw lock to `suspend_current`, which
    /// releases it once the task is parked) and must restore the interrupt
    /// state itself after waking.
    pub fn park_defuse(self) -> bool {
        let state = self.int_state;
        core::mem::forget(self);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering as O};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counter_is_consistent_under_contention() {
        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 80_000);
    }

    #[test]
    fn earlier_ticket_enters_first() {
        // A holds the lock, B queues behind it; B must observe A's write
        // made inside the critical section.
        let lock = Arc::new(SpinLock::new(false));
        let b_started = Arc::new(AtomicBool::new(false));

        let guard = lock.lock();
        let waiter = {
            let lock = Arc::clone(&lock);
            let b_started = Arc::clone(&b_started);
            thread::spawn(move || {
                b_started.store(true, O::SeqCst);
                let g = lock.lock();
                assert!(*g, "ticket order violated: B entered before A finished");
            })
        };
        while !b_started.load(O::SeqCst) {
            std::hint::spin_loop();
        }
        // Give B time to take its ticket and start spinning.
        thread::sleep(std::time::Duration::from_millis(10));
        let mut guard = guard;
        *guard = true;
        drop(guard);
        waiter.join().unwrap();
    }

    #[test]
    fn park_defuse_keeps_the_lock_held() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        let _int_state = guard.park_defuse();
        // Still held: a raw ungrab must be needed before relocking works.
        lock.raw().ungrab();
        drop(lock.lock());
    }
}
