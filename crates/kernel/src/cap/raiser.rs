//! Notification coalescing.
//!
//! A raiser turns any number of raises into at most one outstanding
//! notification: the first raise sends, further raises while un-acked do
//! not, and an ack re-sends only if more raises arrived in the meantime.
//! The owning object's lock serializes access, which is why the methods
//! take `&mut self`.

use alloc::sync::Arc;

use crate::cap::mailbox::{Mailbox, Notification, SlotReservation};

pub struct Raiser {
    reservation: SlotReservation,
    template: Notification,
    raised: u64,
    acked: u64,
}

impl Raiser {
    /// Reserves a producer slot on `mailbox`; released when the raiser
    /// drops.
    pub fn new(mailbox: &Arc<Mailbox>, template: Notification) -> Raiser {
        Raiser {
            reservation: mailbox.reserve_slot(),
            template,
            raised: 0,
            acked: 0,
        }
    }

    /// Record an event; sends only when no notification is outstanding.
    /// Send failures (peer shut down) are the peer's problem, not ours.
    pub fn raise(&mut self) {
        self.raised += 1;
        if self.acked == self.raised - 1 {
            let _ = self.reservation.mailbox().send(self.template);
        }
    }

    /// Consume one outstanding notification; re-raises when events piled
    /// up behind it.
    pub fn ack(&mut self) {
        if self.acked == self.raised {
            return;
        }
        self.acked += 1;
        if self.acked < self.raised {
            let _ = self.reservation.mailbox().send(self.template);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raiser_over(quota: usize) -> (Arc<Mailbox>, Raiser) {
        let mb = Mailbox::create(quota);
        let raiser = Raiser::new(
            &mb,
            Notification {
                kind: 9,
                opaque: 42,
            },
        );
        (mb, raiser)
    }

    #[test]
    fn many_raises_one_notification() {
        let (mb, mut raiser) = raiser_over(8);
        raiser.raise();
        raiser.raise();
        raiser.raise();
        assert_eq!(mb.pending(), 1);
        let note = mb.recv().unwrap();
        assert_eq!(note.opaque, 42);
    }

    #[test]
    fn ack_rearms_when_events_are_pending() {
        let (mb, mut raiser) = raiser_over(8);
        raiser.raise();
        raiser.raise();
        assert_eq!(mb.pending(), 1);
        mb.recv().unwrap();
        raiser.ack();
        // One more notification for the second raise.
        assert_eq!(mb.pending(), 1);
        mb.recv().unwrap();
        raiser.ack();
        assert_eq!(mb.pending(), 0);
        // Spurious ack is inert.
        raiser.ack();
        assert_eq!(mb.pending(), 0);
    }

    #[test]
    fn raise_after_drain_sends_again() {
        let (mb, mut raiser) = raiser_over(8);
        raiser.raise();
        mb.recv().unwrap();
        raiser.ack();
        raiser.raise();
        assert_eq!(mb.pending(), 1);
    }
}
