//! Universes: addressable capability tables.
//!
//! A grow-only cell vector plus a free-index list, under a mutex. Handles
//! are cell indices; a freed cell goes on the free list exactly once and
//! is reused before the vector grows. Universes are ordered by creation
//! id, and a universe handle may only be stored in a universe with a
//! smaller id, so the containment order stays acyclic; cross-universe
//! operations lock in id order, so two transfers can never deadlock.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::cap::cookie::EntryCookie;
use crate::cap::object::{CapSlot, ObjectRef};
use crate::error::{Error, Result};
use crate::sync::{Mutex, MutexGuard};

/// Opaque cell index.
pub type Handle = usize;

static NEXT_UNIVERSE_ID: AtomicU64 = AtomicU64::new(0);

struct Cell {
    slot: Option<CapSlot>,
}

struct UniverseInner {
    cells: Vec<Cell>,
    free: VecDeque<usize>,
}

pub struct Universe {
    /// Creation-ordered id; the containment and locking order.
    id: u64,
    inner: Mutex<UniverseInner>,
}

impl Universe {
    pub fn create() -> Arc<Universe> {
        Arc::new(Universe {
            id: NEXT_UNIVERSE_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(UniverseInner {
                cells: Vec::new(),
                free: VecDeque::new(),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Universe handles may only move into universes created earlier, so
    /// the containment graph stays a DAG. Checking before a move keeps a
    /// rejected reference in the caller's hands instead of dropping it.
    pub fn admits_slot(&self, slot: &CapSlot) -> Result<()> {
        if let ObjectRef::Universe(u) = &slot.object {
            if self.id >= u.id {
                return Err(Error::InvalidUniverseOrder);
            }
        }
        Ok(())
    }

    fn alloc_cell(inner: &mut UniverseInner, slot: CapSlot) -> Result<Handle> {
        if let Some(index) = inner.free.pop_front() {
            debug_assert!(inner.cells[index].slot.is_none(), "free list holds a live cell");
            inner.cells[index].slot = Some(slot);
            return Ok(index);
        }
        let index = inner.cells.len();
        inner.cells.push(Cell { slot: Some(slot) });
        Ok(index)
    }

    /// Store a reference, consuming it. The cell keeps the slot's pin.
    pub fn move_in(&self, slot: CapSlot) -> Result<Handle> {
        self.admits_slot(&slot)?;
        let mut inner = self.inner.lock();
        Self::alloc_cell(&mut inner, slot)
    }

    /// Store two references atomically: either both handles exist or
    /// neither does.
    pub fn move_in_pair(&self, slots: [CapSlot; 2]) -> Result<[Handle; 2]> {
        let [a, b] = slots;
        self.admits_slot(&a)?;
        self.admits_slot(&b)?;
        let mut inner = self.inner.lock();
        let ha = Self::alloc_cell(&mut inner, a)?;
        match Self::alloc_cell(&mut inner, b) {
            Ok(hb) => Ok([ha, hb]),
            Err(e) => {
                // Reclaim the first cell.
                inner.cells[ha].slot = None;
                inner.free.push_back(ha);
                Err(e)
            }
        }
    }

    fn cell_slot<'a>(
        inner: &'a mut MutexGuard<'_, UniverseInner>,
        handle: Handle,
    ) -> Result<&'a mut CapSlot> {
        inner
            .cells
            .get_mut(handle)
            .and_then(|c| c.slot.as_mut())
            .ok_or(Error::InvalidHandle)
    }

    /// Move the reference out, authenticating the pin.
    pub fn move_out(&self, handle: Handle, cookie: &EntryCookie) -> Result<CapSlot> {
        let mut inner = self.inner.lock();
        let slot = Self::cell_slot(&mut inner, handle)?;
        if !slot.unpinned_for(cookie) {
            return Err(Error::SecurityViolation);
        }
        let slot = inner.cells[handle].slot.take().expect("checked above");
        inner.free.push_back(handle);
        Ok(slot)
    }

    /// Borrow the reference (clone), authenticating the pin.
    pub fn borrow_out(&self, handle: Handle, cookie: &EntryCookie) -> Result<CapSlot> {
        let mut inner = self.inner.lock();
        let slot = Self::cell_slot(&mut inner, handle)?;
        if !slot.unpinned_for(cookie) {
            return Err(Error::SecurityViolation);
        }
        Ok(slot.clone())
    }

    /// Drop the reference, authenticating the pin.
    pub fn drop_cell(&self, handle: Handle, cookie: &EntryCookie) -> Result<()> {
        // Take the slot under the lock, drop it outside: releasing the
        // last reference may run object shutdown, which takes its own
        // locks.
        let slot;
        {
            let mut inner = self.inner.lock();
            let cell = Self::cell_slot(&mut inner, handle)?;
            if !cell.unpinned_for(cookie) {
                return Err(Error::SecurityViolation);
            }
            slot = inner.cells[handle].slot.take();
            inner.free.push_back(handle);
        }
        drop(slot);
        Ok(())
    }

    /// Re-pin the cell to the caller's own entry key.
    pub fn pin(&self, handle: Handle, cookie: &EntryCookie) -> Result<()> {
        self.set_pin(handle, cookie, cookie.key())
    }

    /// Release the pin: anybody may handle the reference again.
    pub fn unpin(&self, handle: Handle, cookie: &EntryCookie) -> Result<()> {
        self.set_pin(handle, cookie, crate::cap::cookie::KEY_UNIVERSAL)
    }

    /// Pin the cell to a group's key.
    pub fn pin_to_group(
        &self,
        handle: Handle,
        cookie: &EntryCookie,
        group: &crate::cap::cookie::GroupCookie,
    ) -> Result<()> {
        self.set_pin(handle, cookie, group.key())
    }

    /// Remove a group pin. Fails unless the cell is actually pinned to
    /// that group.
    pub fn unpin_from_group(
        &self,
        handle: Handle,
        cookie: &EntryCookie,
        group: &crate::cap::cookie::GroupCookie,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = Self::cell_slot(&mut inner, handle)?;
        if !slot.unpinned_for(cookie) {
            return Err(Error::SecurityViolation);
        }
        if slot.pin_cookie != group.key() {
            return Err(Error::SecurityViolation);
        }
        slot.pin_cookie = crate::cap::cookie::KEY_UNIVERSAL;
        Ok(())
    }

    fn set_pin(
        &self,
        handle: Handle,
        cookie: &EntryCookie,
        new_key: crate::cap::cookie::CookieKey,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = Self::cell_slot(&mut inner, handle)?;
        if !slot.unpinned_for(cookie) {
            return Err(Error::SecurityViolation);
        }
        slot.pin_cookie = new_key;
        Ok(())
    }

    /// Fork: a new universe holding a borrow of every reference whose pin
    /// authenticates against `cookie`. Universe handles never qualify:
    /// the fork is newer than anything it could contain.
    pub fn fork(&self, cookie: &EntryCookie) -> Result<Arc<Universe>> {
        let forked = Universe::create();
        let inner = self.inner.lock();
        let mut cells = Vec::with_capacity(inner.cells.len());
        for cell in inner.cells.iter() {
            match &cell.slot {
                Some(slot) if slot.unpinned_for(cookie) && forked.admits_slot(slot).is_ok() => {
                    cells.push(Cell {
                        slot: Some(slot.clone()),
                    });
                }
                _ => cells.push(Cell { slot: None }),
            }
        }
        {
            let mut forked_inner = forked.inner.lock();
            for (index, cell) in cells.iter().enumerate() {
                if cell.slot.is_none() {
                    forked_inner.free.push_back(index);
                }
            }
            forked_inner.cells = cells;
        }
        Ok(forked)
    }
}

/// Move a reference between universes, authenticating at the source and
/// enforcing the containment order at the destination. The two mutexes
/// are taken in id order, so concurrent transfers cannot deadlock.
pub fn move_across(
    src: &Arc<Universe>,
    dst: &Arc<Universe>,
    handle: Handle,
    cookie: &EntryCookie,
) -> Result<Handle> {
    transfer(src, dst, handle, cookie, false)
}

/// Borrow a reference from one universe into another.
pub fn borrow_across(
    src: &Arc<Universe>,
    dst: &Arc<Universe>,
    handle: Handle,
    cookie: &EntryCookie,
) -> Result<Handle> {
    transfer(src, dst, handle, cookie, true)
}

fn transfer(
    src: &Arc<Universe>,
    dst: &Arc<Universe>,
    handle: Handle,
    cookie: &EntryCookie,
    borrow: bool,
) -> Result<Handle> {
    if Arc::ptr_eq(src, dst) {
        // Degenerate transfer: one lock is enough.
        let slot = if borrow {
            src.borrow_out(handle, cookie)?
        } else {
            src.move_out(handle, cookie)?
        };
        return src.move_in(slot);
    }
    // Lock in id order; ids are unique.
    let (mut src_guard, mut dst_guard) = if src.id < dst.id {
        let s = src.inner.lock();
        let d = dst.inner.lock();
        (s, d)
    } else {
        let d = dst.inner.lock();
        let s = src.inner.lock();
        (s, d)
    };

    let slot = Universe::cell_slot(&mut src_guard, handle)?;
    if !slot.unpinned_for(cookie) {
        return Err(Error::SecurityViolation);
    }
    dst.admits_slot(slot)?;
    let moved = if borrow {
        slot.clone()
    } else {
        let taken = src_guard.cells[handle].slot.take().expect("checked above");
        src_guard.free.push_back(handle);
        taken
    };
    Universe::alloc_cell(&mut dst_guard, moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::mailbox::MailboxHandle;
    use crate::cap::object::ObjectKind;

    fn mailbox_slot() -> CapSlot {
        CapSlot::unpinned(ObjectRef::Mailbox(MailboxHandle::create(1)))
    }

    #[test]
    fn cells_are_reused_from_the_free_list() {
        let cookie = EntryCookie::create();
        let u = Universe::create();
        let a = u.move_in(mailbox_slot()).unwrap();
        let b = u.move_in(mailbox_slot()).unwrap();
        assert_ne!(a, b);
        u.drop_cell(a, &cookie).unwrap();
        let c = u.move_in(mailbox_slot()).unwrap();
        assert_eq!(c, a, "freed cell must be reused before growing");
        assert!(u.borrow_out(b, &cookie).is_ok());
    }

    #[test]
    fn vacant_and_out_of_range_handles_are_invalid() {
        let cookie = EntryCookie::create();
        let u = Universe::create();
        assert_eq!(u.borrow_out(0, &cookie).unwrap_err(), Error::InvalidHandle);
        let h = u.move_in(mailbox_slot()).unwrap();
        u.move_out(h, &cookie).unwrap();
        assert_eq!(u.borrow_out(h, &cookie).unwrap_err(), Error::InvalidHandle);
        assert_eq!(u.borrow_out(99, &cookie).unwrap_err(), Error::InvalidHandle);
    }

    #[test]
    fn pins_gate_move_borrow_drop() {
        let owner = EntryCookie::create();
        let stranger = EntryCookie::create();
        let u = Universe::create();
        let h = u.move_in(mailbox_slot()).unwrap();
        u.pin(h, &owner).unwrap();
        assert_eq!(
            u.borrow_out(h, &stranger).unwrap_err(),
            Error::SecurityViolation
        );
        assert_eq!(
            u.drop_cell(h, &stranger).unwrap_err(),
            Error::SecurityViolation
        );
        // Pinning again as a stranger is itself gated.
        assert_eq!(u.pin(h, &stranger).unwrap_err(), Error::SecurityViolation);
        u.unpin(h, &owner).unwrap();
        assert!(u.borrow_out(h, &stranger).is_ok());
    }

    #[test]
    fn group_pins() {
        let owner = EntryCookie::create();
        let member = EntryCookie::create();
        let group = crate::cap::cookie::GroupCookie::create();
        member.join(&group).unwrap();
        let u = Universe::create();
        let h = u.move_in(mailbox_slot()).unwrap();
        u.pin_to_group(h, &owner, &group).unwrap();
        assert!(u.borrow_out(h, &member).is_ok());
        // Ungrouping checks the stored key actually is the group's.
        let other = crate::cap::cookie::GroupCookie::create();
        assert_eq!(
            u.unpin_from_group(h, &member, &other).unwrap_err(),
            Error::SecurityViolation
        );
        u.unpin_from_group(h, &member, &group).unwrap();
    }

    #[test]
    fn containment_order_is_enforced() {
        let cookie = EntryCookie::create();
        let u1 = Universe::create();
        let u2 = Universe::create();
        // Storing the older u1 into the newer u2 violates the order.
        assert_eq!(
            u2.move_in(CapSlot::unpinned(ObjectRef::Universe(Arc::clone(&u1))))
                .unwrap_err(),
            Error::InvalidUniverseOrder
        );
        // The other direction is fine.
        let h = u1
            .move_in(CapSlot::unpinned(ObjectRef::Universe(Arc::clone(&u2))))
            .unwrap();
        assert_eq!(u1.borrow_out(h, &cookie).unwrap().object.kind(), ObjectKind::Universe);
    }

    #[test]
    fn move_across_and_fork() {
        let cookie = EntryCookie::create();
        let u1 = Universe::create();
        let u2 = Universe::create();
        let h1 = u1.move_in(mailbox_slot()).unwrap();
        let h2 = move_across(&u1, &u2, h1, &cookie).unwrap();
        assert_eq!(u1.borrow_out(h1, &cookie).unwrap_err(), Error::InvalidHandle);

        let u3 = u2.fork(&cookie).unwrap();
        // The forked universe serves the same handle index.
        let slot = u3.borrow_out(h2, &cookie).unwrap();
        assert_eq!(slot.object.kind(), ObjectKind::Mailbox);
        // Transfers in both directions between old and new work under the
        // id-ordered locking.
        let h_back = move_across(&u3, &u1, h2, &cookie).unwrap();
        assert!(u1.borrow_out(h_back, &cookie).is_ok());
    }

    #[test]
    fn fork_skips_pinned_and_vacant_cells() {
        let owner = EntryCookie::create();
        let stranger = EntryCookie::create();
        let u = Universe::create();
        let h_open = u.move_in(mailbox_slot()).unwrap();
        let h_pinned = u.move_in(mailbox_slot()).unwrap();
        u.pin(h_pinned, &owner).unwrap();
        let h_gone = u.move_in(mailbox_slot()).unwrap();
        u.drop_cell(h_gone, &owner).unwrap();

        let forked = u.fork(&stranger).unwrap();
        assert!(forked.borrow_out(h_open, &stranger).is_ok());
        assert_eq!(
            forked.borrow_out(h_pinned, &stranger).unwrap_err(),
            Error::InvalidHandle
        );
        assert_eq!(
            forked.borrow_out(h_gone, &stranger).unwrap_err(),
            Error::InvalidHandle
        );
        // Vacant cells of the fork are reusable.
        let h_new = forked.move_in(mailbox_slot()).unwrap();
        assert!(forked.borrow_out(h_new, &stranger).is_ok());
    }
}
