//! Kernel synchronization primitives.
//!
//! Ticket spinlocks are the base: FIFO among contending CPUs, interrupts
//! disabled for the hold duration. The mutex and reader/writer lock put
//! tasks to sleep instead of spinning, using the scheduler's atomic
//! park-and-release handoff so a wake-up can never be lost between
//! queueing and suspension.

pub mod mutex;
pub mod rwlock;
pub mod spinlock;

pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use spinlock::{RawTicketLock, SpinGuard, SpinLock};
