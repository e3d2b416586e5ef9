//! Synchronous RPC.
//!
//! Callers issue requests against tokens; callees accept, reply by
//! sequence number, and the reply lands back in the caller's queue with
//! the client's opaque restored. Request state travels in containers owned
//! by the caller: the callee only ever borrows them, which is half of what
//! keeps the caller/callee reference cycle broken. The other half is the
//! token: peers discover a callee through it, and the last token drop
//! releases the callee's storage reference.
//!
//! Shutdown: a caller keeps its reply queue so late replies drain
//! harmlessly; a callee answers every pending and accepted request with
//! the no-reply status before it goes.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::cap::mailbox::{note_kind, Mailbox, Notification};
use crate::cap::raiser::Raiser;
use crate::collections::IntMap;
use crate::config::RPC_MAX_PAYLOAD;
use crate::error::{Error, Result};
use crate::sync::SpinLock;

/// Reply status marking a request the callee never answered.
pub const RPC_STATUS_NOREPLY: u32 = 0;

/// One RPC message. `opaque` carries the client's cookie on the way in
/// and the sequence number between accept and return.
#[derive(Debug, Clone, Copy)]
pub struct RpcMessage {
    pub opaque: u64,
    pub status: u32,
    pub len: u32,
    pub payload: [u8; RPC_MAX_PAYLOAD],
}

impl Default for RpcMessage {
    fn default() -> Self {
        RpcMessage {
            opaque: 0,
            status: 0,
            len: 0,
            payload: [0; RPC_MAX_PAYLOAD],
        }
    }
}

impl RpcMessage {
    pub fn data(&self) -> &[u8] {
        &self.payload[..self.len as usize]
    }
}

/// Per-request state, pooled by the caller.
struct Container {
    message: RpcMessage,
    client_opaque: u64,
    /// Back-reference pinning the caller while the request is in flight.
    caller: Option<Arc<CallerShared>>,
}

impl Container {
    fn new() -> Box<Container> {
        Box::new(Container {
            message: RpcMessage::default(),
            client_opaque: 0,
            caller: None,
        })
    }
}

/// Copy a caller-supplied message body, validating its length.
fn copy_checked(dst: &mut RpcMessage, src: &RpcMessage) -> Result<()> {
    if src.len as usize > RPC_MAX_PAYLOAD {
        return Err(Error::InvalidMsg);
    }
    dst.len = src.len;
    dst.payload[..src.len as usize].copy_from_slice(&src.payload[..src.len as usize]);
    dst.status = src.status;
    Ok(())
}

struct CallerInner {
    free: VecDeque<Box<Container>>,
    replies: VecDeque<Box<Container>>,
    reply_raiser: Raiser,
    shut_down: bool,
}

/// Caller storage; lives until the last in-flight container returns.
pub struct CallerShared {
    inner: SpinLock<CallerInner>,
}

/// The caller capability. Last drop shuts the caller down.
pub struct Caller {
    shared: Arc<CallerShared>,
}

impl Caller {
    pub fn create(mailbox: &Arc<Mailbox>, opaque: u64) -> Arc<Caller> {
        Arc::new(Caller {
            shared: Arc::new(CallerShared {
                inner: SpinLock::new(CallerInner {
                    free: VecDeque::new(),
                    replies: VecDeque::new(),
                    reply_raiser: Raiser::new(
                        mailbox,
                        Notification {
                            kind: note_kind::RPC_REPLY,
                            opaque,
                        },
                    ),
                    shut_down: false,
                }),
            }),
        })
    }

    /// Issue a request against `token`. The message's `opaque` comes back
    /// unchanged with the reply.
    pub fn call(&self, token: &Token, msg: &RpcMessage) -> Result<()> {
        let mut container = {
            let mut inner = self.shared.inner.lock();
            debug_assert!(!inner.shut_down, "call through a dropped caller");
            let mut container = inner.free.pop_front().unwrap_or_else(Container::new);
            if let Err(e) = copy_checked(&mut container.message, msg) {
                inner.free.push_back(container);
                return Err(e);
            }
            container.client_opaque = msg.opaque;
            container.caller = Some(Arc::clone(&self.shared));
            container
        };

        let callee = &token.shared;
        let mut inner = callee.inner.lock();
        if inner.shut_down {
            drop(inner);
            container.caller = None;
            self.shared.inner.lock().free.push_back(container);
            return Err(Error::TargetUnreachable);
        }
        inner.incoming.push_back(container);
        inner.incoming_raiser.raise();
        Ok(())
    }

    /// Take one reply. `StreamEmpty` when none is queued; the reply
    /// notification on the mailbox says when to try again.
    pub fn get_result(&self) -> Result<RpcMessage> {
        let mut inner = self.shared.inner.lock();
        let mut container = inner.replies.pop_front().ok_or(Error::StreamEmpty)?;
        inner.reply_raiser.ack();
        let mut out = container.message;
        out.opaque = container.client_opaque;
        container.caller = None;
        inner.free.push_back(container);
        Ok(out)
    }
}

impl Drop for Caller {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        debug_assert!(!inner.shut_down);
        inner.shut_down = true;
        // The free pool dies with us; queued replies stay for the storage
        // drop, pinned by their own caller back-references.
        inner.free.clear();
    }
}

/// Route a finished container back to its caller's reply queue.
fn enqueue_reply(mut container: Box<Container>) {
    let caller = container
        .caller
        .take()
        .expect("reply container without a caller");
    let mut inner = caller.inner.lock();
    if !inner.shut_down {
        inner.reply_raiser.raise();
    }
    inner.replies.push_back(container);
}

struct CalleeInner {
    incoming: VecDeque<Box<Container>>,
    /// Accepted requests keyed by sequence number.
    awaiting_reply: IntMap<Box<Container>>,
    seq: u64,
    incoming_raiser: Raiser,
    shut_down: bool,
}

/// Callee storage; tokens keep it alive after the callee handle is gone.
pub struct CalleeShared {
    inner: SpinLock<CalleeInner>,
}

/// The callee capability. Last drop shuts the callee down and answers
/// everything pending with `RPC_STATUS_NOREPLY`.
pub struct Callee {
    shared: Arc<CalleeShared>,
}

/// The discovery capability: what peers hold to call the callee.
pub struct Token {
    shared: Arc<CalleeShared>,
}

impl Callee {
    /// `buckets` sizes the awaiting-reply map; zero picks a single bucket.
    pub fn create(
        mailbox: &Arc<Mailbox>,
        opaque: u64,
        buckets: usize,
    ) -> (Arc<Callee>, Arc<Token>) {
        let shared = Arc::new(CalleeShared {
            inner: SpinLock::new(CalleeInner {
                incoming: VecDeque::new(),
                awaiting_reply: IntMap::with_buckets(buckets.max(1)),
                seq: 0,
                incoming_raiser: Raiser::new(
                    mailbox,
                    Notification {
                        kind: note_kind::RPC_INCOMING,
                        opaque,
                    },
                ),
                shut_down: false,
            }),
        });
        let token = Arc::new(Token {
            shared: Arc::clone(&shared),
        });
        (Arc::new(Callee { shared }), token)
    }

    /// Dequeue one request. The returned message's `opaque` is the
    /// sequence number to reply with.
    pub fn accept(&self) -> Result<RpcMessage> {
        let mut inner = self.shared.inner.lock();
        debug_assert!(!inner.shut_down, "accept through a dropped callee");
        let container = inner.incoming.pop_front().ok_or(Error::StreamEmpty)?;
        inner.incoming_raiser.ack();
        let seq = inner.seq;
        inner.seq += 1;
        let mut out = container.message;
        out.opaque = seq;
        inner.awaiting_reply.insert(seq, container);
        Ok(out)
    }

    /// Answer the accepted request `msg.opaque` with `msg`.
    pub fn reply(&self, msg: &RpcMessage) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        debug_assert!(!inner.shut_down, "reply through a dropped callee");
        let container = inner
            .awaiting_reply
            .get_mut(msg.opaque)
            .ok_or(Error::InvalidRpcId)?;
        copy_checked(&mut container.message, msg)?;
        let container = inner
            .awaiting_reply
            .remove(msg.opaque)
            .expect("entry vanished under the lock");
        drop(inner);
        enqueue_reply(container);
        Ok(())
    }
}

impl Drop for Callee {
    fn drop(&mut self) {
        // Collect under the lock, reply outside it: the reply path takes
        // caller locks, and new requests are fenced off by the flag.
        let mut orphans = VecDeque::new();
        {
            let mut inner = self.shared.inner.lock();
            debug_assert!(!inner.shut_down);
            inner.shut_down = true;
            orphans.append(&mut inner.incoming);
            let drained: alloc::vec::Vec<_> =
                inner.awaiting_reply.drain().map(|(_, c)| c).collect();
            orphans.extend(drained);
        }
        for mut container in orphans {
            container.message.status = RPC_STATUS_NOREPLY;
            container.message.len = 0;
            enqueue_reply(container);
        }
    }
}

impl Token {
    /// Whether the callee behind this token still accepts calls.
    pub fn is_reachable(&self) -> bool {
        !self.shared.inner.lock().shut_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc_pair() -> (Arc<Mailbox>, Arc<Mailbox>, Arc<Caller>, Arc<Callee>, Arc<Token>) {
        let client_mb = Mailbox::create(8);
        let server_mb = Mailbox::create(8);
        let caller = Caller::create(&client_mb, 0xcafebabe);
        let (callee, token) = Callee::create(&server_mb, 0xdeadbeef, 16);
        (client_mb, server_mb, caller, callee, token)
    }

    fn msg(opaque: u64, status: u32, data: &[u8]) -> RpcMessage {
        let mut m = RpcMessage::default();
        m.opaque = opaque;
        m.status = status;
        m.len = data.len() as u32;
        m.payload[..data.len()].copy_from_slice(data);
        m
    }

    #[test]
    fn call_accept_reply_round_trip() {
        let (client_mb, server_mb, caller, callee, token) = rpc_pair();
        for i in 0..1000u64 {
            caller.call(&token, &msg(0xabacaba, 5, b"ping")).unwrap();
            let note = server_mb.recv().unwrap();
            assert_eq!(note.kind, note_kind::RPC_INCOMING);
            assert_eq!(note.opaque, 0xdeadbeef);

            let req = callee.accept().unwrap();
            assert_eq!(req.opaque, i, "sequence numbers are monotonic");
            assert_eq!(req.data(), b"ping");

            callee.reply(&msg(req.opaque, 0x77, b"pong")).unwrap();
            let note = client_mb.recv().unwrap();
            assert_eq!(note.kind, note_kind::RPC_REPLY);
            assert_eq!(note.opaque, 0xcafebabe);

            let reply = caller.get_result().unwrap();
            assert_eq!(reply.opaque, 0xabacaba, "client opaque is restored");
            assert_eq!(reply.status, 0x77);
            assert_eq!(reply.data(), b"pong");
        }
    }

    #[test]
    fn replies_queue_per_caller_in_order() {
        let (_cmb, _smb, caller, callee, token) = rpc_pair();
        for i in 0..4u64 {
            caller.call(&token, &msg(100 + i, 1, b"")).unwrap();
        }
        let mut seqs = alloc::vec::Vec::new();
        for _ in 0..4 {
            seqs.push(callee.accept().unwrap().opaque);
        }
        // Reply out of order; the caller still sees replies in reply
        // order with the right opaques.
        for &seq in seqs.iter().rev() {
            callee.reply(&msg(seq, 2, b"")).unwrap();
        }
        let mut opaques = alloc::vec::Vec::new();
        for _ in 0..4 {
            opaques.push(caller.get_result().unwrap().opaque);
        }
        assert_eq!(opaques, alloc::vec![103, 102, 101, 100]);
    }

    #[test]
    fn unknown_sequence_is_rejected() {
        let (_cmb, _smb, caller, callee, token) = rpc_pair();
        caller.call(&token, &msg(1, 0, b"")).unwrap();
        let req = callee.accept().unwrap();
        assert_eq!(
            callee.reply(&msg(req.opaque + 7, 0, b"")).unwrap_err(),
            Error::InvalidRpcId
        );
        callee.reply(&msg(req.opaque, 0, b"")).unwrap();
    }

    #[test]
    fn oversize_payload_is_rejected_and_container_reused() {
        let (_cmb, _smb, caller, _callee, token) = rpc_pair();
        let mut bad = RpcMessage::default();
        bad.len = (RPC_MAX_PAYLOAD + 1) as u32;
        assert_eq!(caller.call(&token, &bad).unwrap_err(), Error::InvalidMsg);
        // The pool kept the container; a good call still works.
        caller.call(&token, &msg(0, 0, b"ok")).unwrap();
    }

    #[test]
    fn empty_accept_and_empty_result() {
        let (_cmb, _smb, caller, callee, _token) = rpc_pair();
        assert_eq!(callee.accept().unwrap_err(), Error::StreamEmpty);
        assert_eq!(caller.get_result().unwrap_err(), Error::StreamEmpty);
    }

    #[test]
    fn callee_drop_answers_pending_with_noreply() {
        let (client_mb, _smb, caller, callee, token) = rpc_pair();
        caller.call(&token, &msg(11, 3, b"a")).unwrap();
        caller.call(&token, &msg(22, 3, b"b")).unwrap();
        // Accept one (in flight), leave one pending, then kill the callee.
        let _accepted = callee.accept().unwrap();
        drop(callee);
        assert!(!token.is_reachable());

        let mut opaques = alloc::vec::Vec::new();
        for _ in 0..2 {
            let reply = caller.get_result().unwrap();
            assert_eq!(reply.status, RPC_STATUS_NOREPLY);
            assert_eq!(reply.len, 0);
            opaques.push(reply.opaque);
        }
        opaques.sort_unstable();
        assert_eq!(opaques, alloc::vec![11, 22]);
        // Reply notifications were raised for the drain.
        assert!(client_mb.pending() >= 1);
        // New calls bounce.
        assert_eq!(
            caller.call(&token, &msg(1, 0, b"")).unwrap_err(),
            Error::TargetUnreachable
        );
    }

    #[test]
    fn caller_drop_lets_late_replies_drain() {
        let (_cmb, _smb, caller, callee, token) = rpc_pair();
        caller.call(&token, &msg(5, 0, b"x")).unwrap();
        let req = callee.accept().unwrap();
        drop(caller);
        // The reply finds a shut-down caller; it must neither crash nor
        // leak, and the callee sees success.
        callee.reply(&msg(req.opaque, 9, b"late")).unwrap();
    }

    #[test]
    fn token_outlives_callee_storage_handoff() {
        let (_cmb, _smb, caller, callee, token) = rpc_pair();
        drop(callee);
        // Calls through a live token to a dead callee are unreachable.
        assert_eq!(
            caller.call(&token, &msg(0, 0, b"")).unwrap_err(),
            Error::TargetUnreachable
        );
        drop(token);
    }
}
