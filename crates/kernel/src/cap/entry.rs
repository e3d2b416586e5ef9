//! User API entry.
//!
//! One entry per userspace thread: its root universe, its entry cookie,
//! and its TLS table. Every operation resolves handles in the root
//! universe, checks the expected object kind, and delegates. Handles for
//! freshly created objects always land in the root; `move_in`/`move_out`
//! shuttle them between the root and sub-universes.

use alloc::sync::Arc;

use crate::cap::cookie::{EntryCookie, GroupCookie};
use crate::cap::mailbox::{MailboxHandle, Notification};
use crate::cap::object::{CapSlot, ObjectKind, ObjectRef};
use crate::cap::rpc::{Callee, Caller, RpcMessage, Token};
use crate::cap::shm::{self, ShmOwner};
use crate::cap::tls::TlsTable;
use crate::cap::universe::{self, Handle, Universe};
use crate::error::{Error, Result};

pub struct ApiEntry {
    universe: Arc<Universe>,
    cookie: Arc<EntryCookie>,
    tls: TlsTable,
}

impl ApiEntry {
    pub fn new() -> Result<ApiEntry> {
        Ok(ApiEntry {
            universe: Universe::create(),
            cookie: EntryCookie::create(),
            tls: TlsTable::new(),
        })
    }

    pub fn cookie(&self) -> &Arc<EntryCookie> {
        &self.cookie
    }

    /// Move a reference in from kernel context (handle handoff between
    /// entries).
    pub fn move_handle_in(&self, slot: CapSlot) -> Result<Handle> {
        self.universe.move_in(slot)
    }

    /// Move a reference out for kernel-context handoff.
    pub fn move_handle_out(&self, handle: Handle) -> Result<CapSlot> {
        self.universe.move_out(handle, &self.cookie)
    }

    fn borrow(&self, handle: Handle) -> Result<CapSlot> {
        self.universe.borrow_out(handle, &self.cookie)
    }

    fn borrow_mailbox(&self, handle: Handle) -> Result<Arc<MailboxHandle>> {
        match self.borrow(handle)?.object {
            ObjectRef::Mailbox(mb) => Ok(mb),
            _ => Err(Error::InvalidHandleType),
        }
    }

    fn borrow_universe(&self, handle: Handle) -> Result<Arc<Universe>> {
        match self.borrow(handle)?.object {
            ObjectRef::Universe(u) => Ok(u),
            _ => Err(Error::InvalidHandleType),
        }
    }

    fn borrow_group(&self, handle: Handle) -> Result<Arc<GroupCookie>> {
        match self.borrow(handle)?.object {
            ObjectRef::GroupCookie(g) => Ok(g),
            _ => Err(Error::InvalidHandleType),
        }
    }

    // --- Mailboxes -----------------------------------------------------

    pub fn create_mailbox(&self, quota: usize) -> Result<Handle> {
        let mailbox = MailboxHandle::create(quota);
        self.universe
            .move_in(CapSlot::unpinned(ObjectRef::Mailbox(mailbox)))
    }

    /// Wait for a notification. Blocks the calling task on an empty
    /// mailbox.
    pub fn get_notification(&self, hmailbox: Handle) -> Result<Notification> {
        self.borrow_mailbox(hmailbox)?.recv()
    }

    // --- RPC -----------------------------------------------------------

    pub fn create_caller(&self, hmailbox: Handle, opaque: u64) -> Result<Handle> {
        let mailbox = self.borrow_mailbox(hmailbox)?;
        let caller = Caller::create(mailbox.mailbox(), opaque);
        self.universe
            .move_in(CapSlot::unpinned(ObjectRef::Caller(caller)))
    }

    /// Returns `(callee handle, token handle)`; the token is what gets
    /// handed to peers.
    pub fn create_callee(
        &self,
        hmailbox: Handle,
        opaque: u64,
        buckets: usize,
    ) -> Result<(Handle, Handle)> {
        let mailbox = self.borrow_mailbox(hmailbox)?;
        let (callee, token) = Callee::create(mailbox.mailbox(), opaque, buckets);
        let handles = self.universe.move_in_pair([
            CapSlot::unpinned(ObjectRef::Callee(callee)),
            CapSlot::unpinned(ObjectRef::Token(token)),
        ])?;
        Ok((handles[0], handles[1]))
    }

    pub fn rpc_call(&self, hcaller: Handle, htoken: Handle, msg: &RpcMessage) -> Result<()> {
        let caller = self.borrow_caller(hcaller)?;
        let token = self.borrow_token(htoken)?;
        caller.call(&token, msg)
    }

    pub fn rpc_accept(&self, hcallee: Handle) -> Result<RpcMessage> {
        self.borrow_callee(hcallee)?.accept()
    }

    pub fn rpc_return(&self, hcallee: Handle, msg: &RpcMessage) -> Result<()> {
        self.borrow_callee(hcallee)?.reply(msg)
    }

    pub fn rpc_recv_reply(&self, hcaller: Handle) -> Result<RpcMessage> {
        self.borrow_caller(hcaller)?.get_result()
    }

    fn borrow_caller(&self, handle: Handle) -> Result<Arc<Caller>> {
        match self.borrow(handle)?.object {
            ObjectRef::Caller(c) => Ok(c),
            _ => Err(Error::InvalidHandleType),
        }
    }

    fn borrow_callee(&self, handle: Handle) -> Result<Arc<Callee>> {
        match self.borrow(handle)?.object {
            ObjectRef::Callee(c) => Ok(c),
            _ => Err(Error::InvalidHandleType),
        }
    }

    fn borrow_token(&self, handle: Handle) -> Result<Arc<Token>> {
        match self.borrow(handle)?.object {
            ObjectRef::Token(t) => Ok(t),
            _ => Err(Error::InvalidHandleType),
        }
    }

    // --- Shared memory -------------------------------------------------

    /// Returns `(owner handle, global id)`.
    pub fn create_shm_owned(&self, size: usize) -> Result<(Handle, u64)> {
        let (owner, id) = ShmOwner::create(size, &self.cookie)?;
        let handle = self
            .universe
            .move_in(CapSlot::unpinned(ObjectRef::ShmOwner(owner)))?;
        Ok((handle, id))
    }

    pub fn borrow_shm_ro(&self, hshm: Handle) -> Result<Handle> {
        self.borrow_shm_ref(hshm, false)
    }

    pub fn borrow_shm_rw(&self, hshm: Handle) -> Result<Handle> {
        self.borrow_shm_ref(hshm, true)
    }

    fn borrow_shm_ref(&self, hshm: Handle, writable: bool) -> Result<Handle> {
        let owner = match self.borrow(hshm)?.object {
            ObjectRef::ShmOwner(o) => o,
            _ => return Err(Error::InvalidHandleType),
        };
        let shm_ref = owner.borrow_ref(writable);
        self.universe
            .move_in(CapSlot::unpinned(ObjectRef::ShmRef(shm_ref)))
    }

    pub fn read_from_shm_ref(&self, href: Handle, offset: usize, buf: &mut [u8]) -> Result<()> {
        match self.borrow(href)?.object {
            ObjectRef::ShmRef(r) => r.read(offset, buf),
            _ => Err(Error::InvalidHandleType),
        }
    }

    pub fn write_to_shm_ref(&self, href: Handle, offset: usize, data: &[u8]) -> Result<()> {
        match self.borrow(href)?.object {
            ObjectRef::ShmRef(r) => r.write(offset, data),
            _ => Err(Error::InvalidHandleType),
        }
    }

    pub fn read_from_shm_id(&self, id: u64, offset: usize, buf: &mut [u8]) -> Result<()> {
        shm::read_by_id(id, offset, buf, &self.cookie)
    }

    pub fn write_to_shm_id(&self, id: u64, offset: usize, data: &[u8]) -> Result<()> {
        shm::write_by_id(id, offset, data, &self.cookie)
    }

    // --- Universes -----------------------------------------------------

    pub fn create_universe(&self) -> Result<Handle> {
        let universe = Universe::create();
        self.universe
            .move_in(CapSlot::unpinned(ObjectRef::Universe(universe)))
    }

    pub fn fork_universe(&self, huniverse: Handle) -> Result<Handle> {
        let universe = self.borrow_universe(huniverse)?;
        let forked = universe.fork(&self.cookie)?;
        self.universe
            .move_in(CapSlot::unpinned(ObjectRef::Universe(forked)))
    }

    /// Move the root handle `h` into the universe at `huniverse`.
    pub fn move_in(&self, huniverse: Handle, h: Handle) -> Result<Handle> {
        let universe = self.borrow_universe(huniverse)?;
        let slot = self.universe.borrow_out(h, &self.cookie)?;
        // Validate the destination before the reference leaves the root.
        universe.admits_slot(&slot)?;
        let slot = self.universe.move_out(h, &self.cookie)?;
        universe.move_in(slot)
    }

    /// Move a handle out of the universe at `huniverse` into the root.
    pub fn move_out(&self, huniverse: Handle, hinner: Handle) -> Result<Handle> {
        let universe = self.borrow_universe(huniverse)?;
        let slot = universe.move_out(hinner, &self.cookie)?;
        self.universe.move_in(slot)
    }

    /// Borrow the root handle `h` into the universe at `huniverse`.
    pub fn borrow_in(&self, huniverse: Handle, h: Handle) -> Result<Handle> {
        let universe = self.borrow_universe(huniverse)?;
        let slot = self.universe.borrow_out(h, &self.cookie)?;
        universe.move_in(slot)
    }

    /// Borrow a handle out of the universe at `huniverse` into the root.
    pub fn borrow_out(&self, huniverse: Handle, hinner: Handle) -> Result<Handle> {
        let universe = self.borrow_universe(huniverse)?;
        let slot = universe.borrow_out(hinner, &self.cookie)?;
        self.universe.move_in(slot)
    }

    pub fn move_across_universes(
        &self,
        hsrc: Handle,
        hdst: Handle,
        hinner: Handle,
    ) -> Result<Handle> {
        let src = self.borrow_universe(hsrc)?;
        let dst = self.borrow_universe(hdst)?;
        universe::move_across(&src, &dst, hinner, &self.cookie)
    }

    pub fn drop_in(&self, huniverse: Handle, hinner: Handle) -> Result<()> {
        self.borrow_universe(huniverse)?
            .drop_cell(hinner, &self.cookie)
    }

    /// Drop a root handle.
    pub fn drop_handle(&self, handle: Handle) -> Result<()> {
        self.universe.drop_cell(handle, &self.cookie)
    }

    // --- Pinning -------------------------------------------------------

    pub fn pin(&self, handle: Handle) -> Result<()> {
        self.universe.pin(handle, &self.cookie)
    }

    pub fn unpin(&self, handle: Handle) -> Result<()> {
        self.universe.unpin(handle, &self.cookie)
    }

    pub fn pin_to_group(&self, handle: Handle, hgrp: Handle) -> Result<()> {
        let group = self.borrow_group(hgrp)?;
        self.universe.pin_to_group(handle, &self.cookie, &group)
    }

    pub fn unpin_from_group(&self, handle: Handle, hgrp: Handle) -> Result<()> {
        let group = self.borrow_group(hgrp)?;
        self.universe.unpin_from_group(handle, &self.cookie, &group)
    }

    // --- Cookies and groups --------------------------------------------

    pub fn create_group_cookie(&self) -> Result<Handle> {
        self.universe
            .move_in(CapSlot::unpinned(ObjectRef::GroupCookie(GroupCookie::create())))
    }

    pub fn create_entry_cookie(&self) -> Result<Handle> {
        self.universe
            .move_in(CapSlot::unpinned(ObjectRef::EntryCookie(EntryCookie::create())))
    }

    pub fn join_group(&self, hgrp: Handle) -> Result<()> {
        let group = self.borrow_group(hgrp)?;
        self.cookie.join(&group)
    }

    pub fn leave_group(&self, hgrp: Handle) -> Result<()> {
        let group = self.borrow_group(hgrp)?;
        self.cookie.leave(&group);
        Ok(())
    }

    pub fn add_entry_to_group(&self, hentry: Handle, hgrp: Handle) -> Result<()> {
        let entry = match self.borrow(hentry)?.object {
            ObjectRef::EntryCookie(e) => e,
            _ => return Err(Error::InvalidHandleType),
        };
        let group = self.borrow_group(hgrp)?;
        entry.join(&group)
    }

    pub fn remove_entry_from_group(&self, hentry: Handle, hgrp: Handle) -> Result<()> {
        let entry = match self.borrow(hentry)?.object {
            ObjectRef::EntryCookie(e) => e,
            _ => return Err(Error::InvalidHandleType),
        };
        let group = self.borrow_group(hgrp)?;
        entry.leave(&group);
        Ok(())
    }

    // --- TLS -----------------------------------------------------------

    pub fn set_tls_key(&self, key: u64, value: u64) -> Result<()> {
        self.tls.set_key(key, value)
    }

    pub fn get_tls_key(&self, key: u64) -> u64 {
        self.tls.get_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn universe_move_semantics_end_to_end() {
        let entry = ApiEntry::new().unwrap();
        let hu1 = entry.create_universe().unwrap();
        let hu2 = entry.create_universe().unwrap();

        let h = entry.create_mailbox(4).unwrap();
        let h1 = entry.move_in(hu1, h).unwrap();
        // The root handle no longer resolves.
        assert_eq!(
            entry.get_notification(h).unwrap_err(),
            Error::InvalidHandle
        );

        let h2 = entry.move_across_universes(hu1, hu2, h1).unwrap();
        let hu3 = entry.fork_universe(hu2).unwrap();
        entry.drop_handle(hu2).unwrap();

        // The fork serves the same handle; the mailbox works through it.
        let h_back = entry.borrow_out(hu3, h2).unwrap();
        let mb = entry.borrow_mailbox(h_back).unwrap();
        mb.send(Notification { kind: 1, opaque: 2 }).unwrap();
        assert_eq!(entry.get_notification(h_back).unwrap().opaque, 2);

        // Storing the older universe u1 into the newer u3 violates the
        // containment order.
        assert_eq!(
            entry.move_in(hu3, hu1).unwrap_err(),
            Error::InvalidUniverseOrder
        );
    }

    #[test]
    fn shm_permissions_end_to_end() {
        let entry = ApiEntry::new().unwrap();
        let (hshm, id) = entry.create_shm_owned(4096).unwrap();

        let mut buf = [0xffu8; 4096];
        entry.read_from_shm_id(id, 0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        assert_eq!(
            entry.read_from_shm_id(id, 128, &mut buf).unwrap_err(),
            Error::OutOfBounds
        );

        let href_ro = entry.borrow_shm_ro(hshm).unwrap();
        let href_rw = entry.borrow_shm_rw(hshm).unwrap();
        let fill = [0xaau8; 4096];
        assert_eq!(
            entry.write_to_shm_ref(href_ro, 0, &fill).unwrap_err(),
            Error::InvalidHandleType
        );
        entry.write_to_shm_ref(href_rw, 0, &fill).unwrap();
        entry.read_from_shm_ref(href_ro, 0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xaa));
        entry.read_from_shm_ref(href_rw, 0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn tls_round_trip() {
        let entry = ApiEntry::new().unwrap();
        entry
            .set_tls_key(0xcafebabe_deadbeef, 0xdeadbeef_cafebabe)
            .unwrap();
        entry
            .set_tls_key(0x0000_0000_ebad_f000, 0xaaaa_aaaa_bbbb_bbbb)
            .unwrap();
        assert_eq!(entry.get_tls_key(0xcafebabe_deadbeef), 0xdeadbeef_cafebabe);
        assert_eq!(entry.get_tls_key(0x0000_0000_ebad_f000), 0xaaaa_aaaa_bbbb_bbbb);
        assert_eq!(entry.get_tls_key(0x1111_2222_3333_4444), 0);
    }

    #[test]
    fn rpc_ping_through_the_entry_surface() {
        let client = ApiEntry::new().unwrap();
        let server = ApiEntry::new().unwrap();

        let h_cmb = client.create_mailbox(8).unwrap();
        let h_smb = server.create_mailbox(8).unwrap();
        let h_caller = client.create_caller(h_cmb, 0xcafebabe).unwrap();
        let (h_callee, h_token_srv) = server.create_callee(h_smb, 0xdeadbeef, 0).unwrap();

        // Hand the token from the server entry to the client entry.
        let token_slot = server.move_handle_out(h_token_srv).unwrap();
        let h_token = client.move_handle_in(token_slot).unwrap();

        const CALLS: u64 = 10_000;
        for i in 0..CALLS {
            let mut msg = RpcMessage::default();
            msg.opaque = 0xabacaba;
            msg.status = 1;
            client.rpc_call(h_caller, h_token, &msg).unwrap();

            let note = server.get_notification(h_smb).unwrap();
            assert_eq!(note.opaque, 0xdeadbeef);
            let req = server.rpc_accept(h_callee).unwrap();
            assert_eq!(req.opaque, i);
            server.rpc_return(h_callee, &req).unwrap();

            let note = client.get_notification(h_cmb).unwrap();
            assert_eq!(note.opaque, 0xcafebabe);
            let reply = client.rpc_recv_reply(h_caller).unwrap();
            assert_eq!(reply.opaque, 0xabacaba);
            assert_eq!(reply.status, 1);
        }
    }

    #[test]
    fn type_mismatches_are_reported() {
        let entry = ApiEntry::new().unwrap();
        let h_mb = entry.create_mailbox(1).unwrap();
        assert_eq!(
            entry.rpc_accept(h_mb).unwrap_err(),
            Error::InvalidHandleType
        );
        assert_eq!(
            entry.fork_universe(h_mb).unwrap_err(),
            Error::InvalidHandleType
        );
        let hu = entry.create_universe().unwrap();
        assert_eq!(
            entry.get_notification(hu).unwrap_err(),
            Error::InvalidHandleType
        );
    }

    #[test]
    fn groups_through_the_entry_surface() {
        let alice = ApiEntry::new().unwrap();
        let bob = ApiEntry::new().unwrap();
        let h_grp = alice.create_group_cookie().unwrap();

        // Alice shares an SHM with the group; Bob joins via a handed-over
        // group cookie and gains access.
        let (hshm, id) = alice.create_shm_owned(64).unwrap();
        let grp = alice.borrow_group(h_grp).unwrap();
        let owner = match alice.borrow(hshm).unwrap().object {
            ObjectRef::ShmOwner(o) => o,
            _ => unreachable!(),
        };
        owner.give_ownership_to_group(&grp, false);

        let grp_slot = alice.move_handle_out(h_grp).unwrap();
        let h_grp_bob = bob.move_handle_in(grp_slot).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(
            bob.read_from_shm_id(id, 0, &mut buf).unwrap_err(),
            Error::SecurityViolation
        );
        bob.join_group(h_grp_bob).unwrap();
        bob.read_from_shm_id(id, 0, &mut buf).unwrap();
        bob.leave_group(h_grp_bob).unwrap();
        assert_eq!(
            bob.read_from_shm_id(id, 0, &mut buf).unwrap_err(),
            Error::SecurityViolation
        );
    }
}
