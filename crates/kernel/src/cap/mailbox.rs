//! Notification mailboxes.
//!
//! A bounded ring of notifications plus a sleep queue of tasks waiting on
//! empty. Send prefers handing the notification straight to a parked
//! waiter's buffer; only then does it touch the ring. Two reference counts
//! govern the object: the capability handle count, whose last drop shuts
//! the mailbox down one-way, and the storage count, which producers
//! (raisers, streams) keep alive through slot reservations so a shutdown
//! mailbox stays safe to poke until the last producer lets go.

use alloc::sync::Arc;
use alloc::vec::Vec;
use alloc::collections::VecDeque;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

use crate::arch;
use crate::error::{Error, Result};
use crate::sched::localsched;
use crate::sched::task::Task;
use crate::sync::SpinLock;

/// One notification: a kind tag plus an opaque value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub kind: u64,
    pub opaque: u64,
}

/// Notification kinds.
pub mod note_kind {
    /// IPC stream got a message or lost its peer.
    pub const STREAM_UPDATE: u64 = 0;
    /// RPC request arrived at a callee.
    pub const RPC_INCOMING: u64 = 1;
    /// RPC reply arrived at a caller.
    pub const RPC_REPLY: u64 = 2;
}

struct Waiter {
    task: NonNull<Task>,
    /// Receive buffer on the parked task's stack.
    slot: NonNull<Notification>,
}

struct MailboxInner {
    notes: Vec<Notification>,
    head: usize,
    tail: usize,
    sleepers: VecDeque<Waiter>,
    shutdown: bool,
}

// SAFETY: waiter pointers are only touched under the mailbox lock, and
// point into stacks of tasks parked until we wake them.
unsafe impl Send for MailboxInner {}

/// Shared mailbox storage. `Arc<Mailbox>` clones are the storage count;
/// producers hold them through [`Mailbox::reserve_slot`].
pub struct Mailbox {
    inner: SpinLock<MailboxInner>,
    quota: usize,
}

/// A producer's claim on the mailbox storage.
pub struct SlotReservation {
    mailbox: Arc<Mailbox>,
}

impl SlotReservation {
    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }
}

impl Mailbox {
    /// A zero quota is clamped to one slot.
    pub fn create(quota: usize) -> Arc<Mailbox> {
        let quota = quota.max(1);
        let mut notes = Vec::new();
        notes.resize(
            quota,
            Notification { kind: 0, opaque: 0 },
        );
        Arc::new(Mailbox {
            inner: SpinLock::new(MailboxInner {
                notes,
                head: 0,
                tail: 0,
                sleepers: VecDeque::new(),
                shutdown: false,
            }),
            quota,
        })
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    /// Reserve a producer slot, pinning the storage.
    pub fn reserve_slot(self: &Arc<Self>) -> SlotReservation {
        SlotReservation {
            mailbox: Arc::clone(self),
        }
    }

    /// Deliver a notification: straight into a waiter's buffer if one is
    /// parked, else into the ring.
    pub fn send(&self, note: Notification) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return Err(Error::TargetUnreachable);
        }
        if let Some(waiter) = inner.sleepers.pop_front() {
            // SAFETY: the slot points into the stack of a task parked in
            // recv(); it cannot resume before the wake below.
            unsafe { waiter.slot.as_ptr().write(note) };
            drop(inner);
            // SAFETY: queued by the task now parked in recv().
            unsafe { localsched::wake_up(waiter.task) };
            return Ok(());
        }
        if inner.head - inner.tail == self.quota {
            return Err(Error::QuotaExceeded);
        }
        let head = inner.head;
        let slot = head % self.quota;
        inner.notes[slot] = note;
        inner.head = head + 1;
        Ok(())
    }

    /// Take the oldest notification, parking the current task when the
    /// ring is empty. Only the capability holder receives, so a shut-down
    /// mailbox here means a kernel bug; release builds report it.
    pub fn recv(&self) -> Result<Notification> {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.shutdown, "receive on a shut-down mailbox");
        if inner.shutdown {
            return Err(Error::MailboxShutdown);
        }
        if inner.head != inner.tail {
            let tail = inner.tail;
            let note = inner.notes[tail % self.quota];
            inner.tail = tail + 1;
            return Ok(note);
        }
        let mut buf: MaybeUninit<Notification> = MaybeUninit::uninit();
        inner.sleepers.push_back(Waiter {
            task: localsched::current_task(),
            slot: NonNull::new(buf.as_mut_ptr()).expect("stack slot is never null"),
        });
        let int_state = inner.park_defuse();
        // SAFETY: the mailbox lock is held (defused); the scheduler drops
        // it once this task is parked. The waker fills `buf` before the
        // wake-up.
        unsafe { localsched::suspend_current(Some(self.inner.raw())) };
        arch::interrupts_restore(int_state);
        // SAFETY: woken only by send(), which wrote the slot.
        Ok(unsafe { buf.assume_init() })
    }

    /// Pending notification count (diagnostics).
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock();
        inner.head - inner.tail
    }

    fn shutdown(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(
            inner.sleepers.is_empty(),
            "task parked on a mailbox being shut down"
        );
        inner.shutdown = true;
    }
}

/// The mailbox capability. Borrowed references share the handle; when the
/// last one drops, the mailbox shuts down and further sends fail with
/// `TargetUnreachable`.
pub struct MailboxHandle {
    mailbox: Arc<Mailbox>,
}

impl MailboxHandle {
    pub fn create(quota: usize) -> Arc<MailboxHandle> {
        Arc::new(MailboxHandle {
            mailbox: Mailbox::create(quota),
        })
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    pub fn send(&self, note: Notification) -> Result<()> {
        self.mailbox.send(note)
    }

    pub fn recv(&self) -> Result<Notification> {
        self.mailbox.recv()
    }
}

impl Drop for MailboxHandle {
    fn drop(&mut self) {
        self.mailbox.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_preserves_send_order() {
        let mb = Mailbox::create(4);
        for i in 0..3 {
            mb.send(Notification { kind: 7, opaque: i }).unwrap();
        }
        for i in 0..3 {
            let n = mb.recv().unwrap();
            assert_eq!(n.kind, 7);
            assert_eq!(n.opaque, i);
        }
    }

    #[test]
    fn quota_bounds_the_ring() {
        let mb = Mailbox::create(2);
        mb.send(Notification { kind: 0, opaque: 0 }).unwrap();
        mb.send(Notification { kind: 0, opaque: 1 }).unwrap();
        assert_eq!(
            mb.send(Notification { kind: 0, opaque: 2 }),
            Err(Error::QuotaExceeded)
        );
        assert_eq!(mb.pending(), 2);
        mb.recv().unwrap();
        mb.send(Notification { kind: 0, opaque: 2 }).unwrap();
        assert_eq!(mb.recv().unwrap().opaque, 1);
        assert_eq!(mb.recv().unwrap().opaque, 2);
    }

    #[test]
    fn zero_quota_clamps_to_one() {
        let mb = Mailbox::create(0);
        assert_eq!(mb.quota(), 1);
        mb.send(Notification { kind: 1, opaque: 9 }).unwrap();
        assert_eq!(
            mb.send(Notification { kind: 1, opaque: 10 }),
            Err(Error::QuotaExceeded)
        );
    }

    #[test]
    fn shutdown_rejects_senders() {
        let handle = MailboxHandle::create(2);
        let mailbox = Arc::clone(handle.mailbox());
        let borrowed = Arc::clone(&handle);
        drop(handle);
        // A borrowed capability still holds the handle open.
        borrowed.send(Notification { kind: 2, opaque: 1 }).unwrap();
        drop(borrowed);
        assert_eq!(
            mailbox.send(Notification { kind: 2, opaque: 2 }),
            Err(Error::TargetUnreachable)
        );
    }

    #[test]
    fn slot_reservation_keeps_storage_alive_across_shutdown() {
        let handle = MailboxHandle::create(1);
        let reservation = handle.mailbox().reserve_slot();
        drop(handle);
        // Storage is still there; sends observe shutdown instead of UAF.
        assert_eq!(
            reservation.mailbox().send(Notification { kind: 0, opaque: 0 }),
            Err(Error::TargetUnreachable)
        );
    }
}
