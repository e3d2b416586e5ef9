//! Sleeping mutex.
//!
//! A ticket spinlock guards the state; contenders park on a FIFO sleep
//! queue instead of spinning. Unlock hands the mutex directly to the first
//! sleeper (the taken flag stays set), so ownership transfers without a
//! window where a third party could barge in.

use alloc::collections::VecDeque;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use crate::sched::localsched;
use crate::sched::task::Task;
use crate::sync::SpinLock;
use crate::arch;

struct MutexState {
    taken: bool,
    sleepers: VecDeque<NonNull<Task>>,
}

// SAFETY: sleeper pointers are only touched under the state lock.
unsafe impl Send for MutexState {}

pub struct Mutex<T: ?Sized> {
    state: SpinLock<MutexState>,
    data: UnsafeCell<T>,
}

// SAFETY: access to the data happens only through the guard.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Mutex {
            state: SpinLock::new(MutexState {
                taken: false,
                sleepers: VecDeque::new(),
            }),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let mut state = self.state.lock();
        if !state.taken {
            state.taken = true;
            drop(state);
            return MutexGuard { mutex: self };
        }
        state.sleepers.push_back(localsched::current_task());
        let int_state = state.park_defuse();
        // SAFETY: the state lock is held (defused guard); the scheduler
        // releases it once this task is off the run queue. When the task is
        // woken, unlock has already transferred ownership to it.
        unsafe { localsched::suspend_current(Some(self.state.raw())) };
        arch::interrupts_restore(int_state);
        MutexGuard { mutex: self }
    }

    fn unlock(&self) {
        let mut state = self.state.lock();
        if let Some(task) = state.sleepers.pop_front() {
            // Ownership passes to the sleeper; taken stays set.
            drop(state);
            // SAFETY: the pointer was queued by a task now parked in lock().
            unsafe { localsched::wake_up(task) };
        } else {
            state.taken = false;
        }
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard owns the mutex.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard owns the mutex exclusively.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
