//! Userspace capability objects.
//!
//! Kernel objects are reference-counted and reached through tagged
//! capability references stored in universes (addressable handle tables).
//! A pin cookie on every reference controls who may move, borrow or drop
//! it. Mailboxes deliver notifications; IPC streams and RPC endpoints
//! ride on them; shared-memory objects carry their own read/write keys.
//!
//! Objects that must shut down before they can be freed (mailboxes,
//! callers, callees) split the two: the capability handle's last drop runs
//! shutdown, while the storage lives until every internal reference
//! (tokens, in-flight request containers, reserved mailbox slots) is gone.

pub mod cookie;
pub mod entry;
pub mod ipc;
pub mod mailbox;
pub mod object;
pub mod raiser;
pub mod rpc;
pub mod shm;
pub mod tls;
pub mod universe;
