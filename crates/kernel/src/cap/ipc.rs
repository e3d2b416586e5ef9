//! IPC streams.
//!
//! A bounded ring of fixed-size messages with a backing mailbox for
//! wake-ups. Events are coalesced through a raised flag: the first message
//! after a receive sends one notification, the rest ride along until the
//! consumer drains the ring. Each side shuts its end down independently;
//! the consumer learns about a closed producer through one final
//! notification.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::cap::mailbox::{note_kind, Mailbox, Notification, SlotReservation};
use crate::config::IPC_MAX_PAYLOAD;
use crate::error::{Error, Result};
use crate::sync::SpinLock;

/// One stream message.
#[derive(Debug, Clone, Copy)]
pub struct IpcMessage {
    len: u32,
    payload: [u8; IPC_MAX_PAYLOAD],
}

impl IpcMessage {
    /// Fails with `InvalidMsg` beyond the 120-byte payload bound.
    pub fn new(data: &[u8]) -> Result<IpcMessage> {
        if data.len() > IPC_MAX_PAYLOAD {
            return Err(Error::InvalidMsg);
        }
        let mut payload = [0u8; IPC_MAX_PAYLOAD];
        payload[..data.len()].copy_from_slice(data);
        Ok(IpcMessage {
            len: data.len() as u32,
            payload,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.payload[..self.len as usize]
    }
}

impl Default for IpcMessage {
    fn default() -> Self {
        IpcMessage {
            len: 0,
            payload: [0; IPC_MAX_PAYLOAD],
        }
    }
}

struct StreamInner {
    msgs: Vec<IpcMessage>,
    head: usize,
    tail: usize,
    /// One-shot event flag: set on the notification send, cleared when a
    /// receive empties the ring.
    raised: bool,
    shutdown: bool,
}

/// Shared stream state. Handed out through producer/consumer handles.
pub struct IpcStream {
    inner: SpinLock<StreamInner>,
    reservation: SlotReservation,
    opaque: u64,
    quota: usize,
}

impl IpcStream {
    /// A zero quota is clamped to one message.
    pub fn create(quota: usize, mailbox: &Arc<Mailbox>, opaque: u64) -> Arc<IpcStream> {
        let quota = quota.max(1);
        let mut msgs = Vec::new();
        msgs.resize(quota, IpcMessage::default());
        Arc::new(IpcStream {
            inner: SpinLock::new(StreamInner {
                msgs,
                head: 0,
                tail: 0,
                raised: false,
                shutdown: false,
            }),
            reservation: mailbox.reserve_slot(),
            opaque,
            quota,
        })
    }

    fn raise_event(&self, inner: &mut StreamInner) {
        if !inner.raised {
            inner.raised = true;
            let _ = self.reservation.mailbox().send(Notification {
                kind: note_kind::STREAM_UPDATE,
                opaque: self.opaque,
            });
        }
    }

    /// Raise the update notification without sending data.
    pub fn send_signal(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return Err(Error::TargetUnreachable);
        }
        self.raise_event(&mut inner);
        Ok(())
    }

    pub fn send(&self, msg: &IpcMessage) -> Result<()> {
        if msg.len as usize > IPC_MAX_PAYLOAD {
            return Err(Error::InvalidMsg);
        }
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return Err(Error::TargetUnreachable);
        }
        if inner.head - inner.tail == self.quota {
            return Err(Error::QuotaExceeded);
        }
        let head = inner.head;
        let slot = head % self.quota;
        inner.msgs[slot] = *msg;
        inner.head = head + 1;
        self.raise_event(&mut inner);
        Ok(())
    }

    /// Non-blocking receive; the consumer waits on the mailbox, not here.
    /// The event flag clears only once the ring drains.
    pub fn recv(&self) -> Result<IpcMessage> {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return Err(Error::TargetUnreachable);
        }
        if inner.head == inner.tail {
            return Err(Error::StreamEmpty);
        }
        let tail = inner.tail;
        let msg = inner.msgs[tail % self.quota];
        inner.tail = tail + 1;
        if inner.head == inner.tail {
            inner.raised = false;
        }
        Ok(msg)
    }

    fn shutdown_producer_side(&self) {
        let mut inner = self.inner.lock();
        if !inner.shutdown {
            // Last chance for the consumer to notice the closed end.
            self.raise_event(&mut inner);
        }
        inner.shutdown = true;
    }

    fn shutdown_consumer_side(&self) {
        self.inner.lock().shutdown = true;
    }
}

/// Producing end; dropping it closes the stream and notifies the consumer.
pub struct StreamProducer {
    stream: Arc<IpcStream>,
}

impl StreamProducer {
    pub fn new(stream: Arc<IpcStream>) -> StreamProducer {
        StreamProducer { stream }
    }

    pub fn send(&self, msg: &IpcMessage) -> Result<()> {
        self.stream.send(msg)
    }

    pub fn send_signal(&self) -> Result<()> {
        self.stream.send_signal()
    }
}

impl Drop for StreamProducer {
    fn drop(&mut self) {
        self.stream.shutdown_producer_side();
    }
}

/// Consuming end; dropping it closes the stream for the producer.
pub struct StreamConsumer {
    stream: Arc<IpcStream>,
}

impl StreamConsumer {
    pub fn new(stream: Arc<IpcStream>) -> StreamConsumer {
        StreamConsumer { stream }
    }

    pub fn recv(&self) -> Result<IpcMessage> {
        self.stream.recv()
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        self.stream.shutdown_consumer_side();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_pair(quota: usize) -> (Arc<Mailbox>, StreamProducer, StreamConsumer) {
        let mb = Mailbox::create(8);
        let stream = IpcStream::create(quota, &mb, 0xfeed);
        (
            mb,
            StreamProducer::new(Arc::clone(&stream)),
            StreamConsumer::new(stream),
        )
    }

    #[test]
    fn messages_round_trip_in_order() {
        let (mb, tx, rx) = stream_pair(4);
        tx.send(&IpcMessage::new(b"one").unwrap()).unwrap();
        tx.send(&IpcMessage::new(b"two").unwrap()).unwrap();
        // Coalesced: one notification for both messages.
        assert_eq!(mb.pending(), 1);
        let note = mb.recv().unwrap();
        assert_eq!(note.kind, note_kind::STREAM_UPDATE);
        assert_eq!(note.opaque, 0xfeed);
        assert_eq!(rx.recv().unwrap().data(), b"one");
        assert_eq!(rx.recv().unwrap().data(), b"two");
        assert_eq!(rx.recv().unwrap_err(), Error::StreamEmpty);
        // Drained ring re-arms the event.
        tx.send(&IpcMessage::new(b"three").unwrap()).unwrap();
        assert_eq!(mb.pending(), 1);
    }

    #[test]
    fn oversize_message_is_rejected() {
        let data = [0u8; IPC_MAX_PAYLOAD + 1];
        assert_eq!(IpcMessage::new(&data).unwrap_err(), Error::InvalidMsg);
        let ok = [0u8; IPC_MAX_PAYLOAD];
        assert!(IpcMessage::new(&ok).is_ok());
    }

    #[test]
    fn quota_full_fails_send() {
        let (_mb, tx, _rx) = stream_pair(2);
        tx.send(&IpcMessage::new(b"a").unwrap()).unwrap();
        tx.send(&IpcMessage::new(b"b").unwrap()).unwrap();
        assert_eq!(
            tx.send(&IpcMessage::new(b"c").unwrap()).unwrap_err(),
            Error::QuotaExceeded
        );
    }

    #[test]
    fn producer_drop_notifies_then_blocks_the_channel() {
        let (mb, tx, rx) = stream_pair(2);
        drop(tx);
        // The close raised one last notification.
        assert_eq!(mb.pending(), 1);
        assert_eq!(rx.recv().unwrap_err(), Error::TargetUnreachable);
    }

    #[test]
    fn consumer_drop_blocks_the_producer() {
        let (_mb, tx, rx) = stream_pair(2);
        drop(rx);
        assert_eq!(
            tx.send(&IpcMessage::new(b"x").unwrap()).unwrap_err(),
            Error::TargetUnreachable
        );
    }
}
