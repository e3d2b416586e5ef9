//! Writer-fair reader/writer lock.
//!
//! Readers share the lock, but a non-empty sleep queue blocks new readers
//! even while the lock is read-held, so a queued writer cannot starve.
//! Unlock wakes either one writer or the whole contiguous run of readers at
//! the head of the queue.

use alloc::collections::VecDeque;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use crate::arch;
use crate::sched::localsched;
use crate::sched::task::Task;
use crate::sync::SpinLock;

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Free,
    TakenRead,
    TakenWrite,
}

struct Waiter {
    task: NonNull<Task>,
    writing: bool,
}

struct RwState {
    state: State,
    readers: usize,
    sleepers: VecDeque<Waiter>,
}

// SAFETY: waiter pointers are only touched under the state lock.
unsafe impl Send for RwState {}

pub struct RwLock<T: ?Sized> {
    state: SpinLock<RwState>,
    data: UnsafeCell<T>,
}

// SAFETY: access to the data happens only through the guards.
unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub const fn new(data: T) -> Self {
        RwLock {
            state: SpinLock::new(RwState {
                state: State::Free,
                readers: 0,
                sleepers: VecDeque::new(),
            }),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let mut st = self.state.lock();
        match st.state {
            State::Free => {
                st.state = State::TakenRead;
                st.readers = 1;
                drop(st);
                return RwLockReadGuard { lock: self };
            }
            // New readers only pass while nobody is queued, which is what
            // keeps queued writers from starving.
            State::TakenRead if st.sleepers.is_empty() => {
                st.readers += 1;
                drop(st);
                return RwLockReadGuard { lock: self };
            }
            _ => {}
        }
        st.sleepers.push_back(Waiter {
            task: localsched::current_task(),
            writing: false,
        });
        let int_state = st.park_defuse();
        // SAFETY: state lock held; the scheduler releases it after parking.
        // When woken, unlock has already counted this task as a reader.
        unsafe { localsched::suspend_current(Some(self.state.raw())) };
        arch::interrupts_restore(int_state);
        RwLockReadGuard { lock: self }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let mut st = self.state.lock();
        if st.state == State::Free {
            st.state = State::TakenWrite;
            drop(st);
            return RwLockWriteGuard { lock: self };
        }
        st.sleepers.push_back(Waiter {
            task: localsched::current_task(),
            writing: true,
        });
        let int_state = st.park_defuse();
        // SAFETY: as in read(); ownership is transferred before the wake.
        unsafe { localsched::suspend_current(Some(self.state.raw())) };
        arch::interrupts_restore(int_state);
        RwLockWriteGuard { lock: self }
    }

    fn unlock_read(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.state == State::TakenRead && st.readers > 0);
        st.readers -= 1;
        if st.readers > 0 {
            // Remaining readers will do the waking when the last one leaves.
            return;
        }
        self.wake_next(st);
    }

    fn unlock_write(&self) {
        let st = self.state.lock();
        debug_assert!(st.state == State::TakenWrite);
        self.wake_next(st);
    }

    /// Hand the lock to the head of the queue: one writer, or the whole
    /// contiguous run of readers.
    fn wake_next(&self, mut st: crate::sync::SpinGuard<'_, RwState>) {
        match st.sleepers.pop_front() {
            None => {
                st.state = State::Free;
                st.readers = 0;
            }
            Some(w) if w.writing => {
                st.state = State::TakenWrite;
                st.readers = 0;
                drop(st);
                // SAFETY: queued by a task parked in write().
                unsafe { localsched::wake_up(w.task) };
                return;
            }
            Some(first_reader) => {
                st.state = State::TakenRead;
                let mut batch = VecDeque::new();
                batch.push_back(first_reader);
                while matches!(st.sleepers.front(), Some(w) if !w.writing) {
                    let w = st.sleepers.pop_front().expect("front checked");
                    batch.push_back(w);
                }
                st.readers = batch.len();
                drop(st);
                for w in batch {
                    // SAFETY: queued by tasks parked in read().
                    unsafe { localsched::wake_up(w.task) };
                }
                return;
            }
        }
    }
}

pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: read guard holds the lock shared.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: write guard holds the lock exclusively.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: write guard holds the lock exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_uncontended_readers() {
        let l = RwLock::new(5u32);
        let a = l.read();
        let b = l.read();
        assert_eq!(*a + *b, 10);
        drop(a);
        drop(b);
        let mut w = l.write();
        *w = 6;
        drop(w);
        assert_eq!(*l.read(), 6);
    }

    #[test]
    fn write_then_read_sequential() {
        let l = RwLock::new(0u32);
        *l.write() = 1;
        *l.write() = 2;
        assert_eq!(*l.read(), 2);
    }
}
