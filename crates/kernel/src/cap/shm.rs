//! Shared-memory objects.
//!
//! An owner holds a zero-initialized buffer, a process-wide numeric id in
//! the sharded global registry, and two cookie keys: one gating reads, one
//! gating writes. Access by id authenticates against those keys; access
//! through a borrowed reference does not: possession of the ref is the
//! capability, and a read-only ref refuses writes outright.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::cap::cookie::{CookieKey, EntryCookie, GroupCookie, KEY_UNIVERSAL};
use crate::collections::IntMap;
use crate::config::{SHM_SHARDS, SHM_SHARD_BUCKETS};
use crate::error::{Error, Result};
use crate::sync::SpinLock;

struct Perms {
    ro_key: CookieKey,
    rw_key: CookieKey,
}

struct ShmShared {
    id: u64,
    size: usize,
    data: *mut u8,
    perms: SpinLock<Perms>,
}

// SAFETY: the buffer is never reallocated; concurrent byte-level access is
// the shared-memory contract, racing userspace owns the consequences.
unsafe impl Send for ShmShared {}
unsafe impl Sync for ShmShared {}

impl Drop for ShmShared {
    fn drop(&mut self) {
        // SAFETY: allocated in create() with this exact layout.
        unsafe {
            alloc::alloc::dealloc(
                self.data,
                core::alloc::Layout::from_size_align(self.size, 16).expect("checked in create"),
            );
        }
    }
}

impl ShmShared {
    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        let end = offset.checked_add(len).ok_or(Error::OutOfBounds)?;
        if end > self.size {
            return Err(Error::OutOfBounds);
        }
        Ok(())
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        // SAFETY: bounds checked; shared-memory reads may race writers by
        // contract.
        unsafe {
            core::ptr::copy_nonoverlapping(self.data.add(offset), buf.as_mut_ptr(), buf.len())
        };
        Ok(())
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_bounds(offset, data.len())?;
        // SAFETY: as in read().
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), self.data.add(offset), data.len()) };
        Ok(())
    }

    fn auth_read(&self, cookie: &EntryCookie) -> bool {
        let perms = self.perms.lock();
        cookie.authenticates(perms.rw_key) || cookie.authenticates(perms.ro_key)
    }

    fn auth_write(&self, cookie: &EntryCookie) -> bool {
        cookie.authenticates(self.perms.lock().rw_key)
    }
}

/// Global id registry, sharded by id with one lock per shard.
pub struct ShmRegistry {
    shards: Vec<SpinLock<IntMap<Arc<ShmShared>>>>,
    next_id: AtomicU64,
}

impl ShmRegistry {
    fn new() -> ShmRegistry {
        let mut shards = Vec::with_capacity(SHM_SHARDS);
        shards.resize_with(SHM_SHARDS, || {
            SpinLock::new(IntMap::with_buckets(SHM_SHARD_BUCKETS))
        });
        ShmRegistry {
            shards,
            next_id: AtomicU64::new(1),
        }
    }

    fn shard(&self, id: u64) -> &SpinLock<IntMap<Arc<ShmShared>>> {
        &self.shards[(id % SHM_SHARDS as u64) as usize]
    }

    fn find(&self, id: u64) -> Option<Arc<ShmShared>> {
        self.shard(id).lock().get(id).cloned()
    }
}

static REGISTRY: spin::Once<ShmRegistry> = spin::Once::new();

fn registry() -> &'static ShmRegistry {
    REGISTRY.call_once(ShmRegistry::new)
}

/// The owner capability. Last drop unregisters the id; borrowed refs keep
/// the buffer itself alive.
pub struct ShmOwner {
    shared: Arc<ShmShared>,
}

/// A borrowed access capability, read-only or read-write. Carries the
/// owner's current permission level transitively, with no cookie checks.
pub struct ShmRef {
    shared: Arc<ShmShared>,
    writable: bool,
}

impl ShmOwner {
    /// Allocate a zeroed buffer, register it, and stamp both keys to the
    /// creator.
    pub fn create(size: usize, cookie: &EntryCookie) -> Result<(Arc<ShmOwner>, u64)> {
        if size == 0 {
            return Err(Error::OutOfBounds);
        }
        let layout =
            core::alloc::Layout::from_size_align(size, 16).map_err(|_| Error::OutOfMemory)?;
        // SAFETY: non-zero size, valid layout.
        let data = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if data.is_null() {
            return Err(Error::OutOfMemory);
        }
        let registry = registry();
        let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(ShmShared {
            id,
            size,
            data,
            perms: SpinLock::new(Perms {
                ro_key: cookie.key(),
                rw_key: cookie.key(),
            }),
        });
        registry.shard(id).lock().insert(id, Arc::clone(&shared));
        Ok((Arc::new(ShmOwner { shared }), id))
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Borrow an access reference carrying the current permission level.
    pub fn borrow_ref(&self, writable: bool) -> Arc<ShmRef> {
        Arc::new(ShmRef {
            shared: Arc::clone(&self.shared),
            writable,
        })
    }

    fn set_key(&self, key: CookieKey, rw: bool) {
        let mut perms = self.shared.perms.lock();
        if rw {
            perms.rw_key = key;
        } else {
            perms.ro_key = key;
        }
    }

    /// Open the given access level to everybody.
    pub fn drop_ownership(&self, rw: bool) {
        self.set_key(KEY_UNIVERSAL, rw);
    }

    /// Restrict the given access level to `cookie`'s entry.
    pub fn acquire_ownership(&self, cookie: &EntryCookie, rw: bool) {
        self.set_key(cookie.key(), rw);
    }

    /// Hand the given access level to a group.
    pub fn give_ownership_to_group(&self, group: &GroupCookie, rw: bool) {
        self.set_key(group.key(), rw);
    }
}

impl Drop for ShmOwner {
    fn drop(&mut self) {
        registry().shard(self.shared.id).lock().remove(self.shared.id);
    }
}

impl ShmRef {
    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.shared.read(offset, buf)
    }

    /// Writes through a read-only ref are a tag mismatch, not a security
    /// failure: the ref kind says what it can do.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::InvalidHandleType);
        }
        self.shared.write(offset, data)
    }
}

/// Read by global id, authenticating against either key. A missing id
/// reports `SecurityViolation` so ids cannot be probed apart from keys.
pub fn read_by_id(id: u64, offset: usize, buf: &mut [u8], cookie: &EntryCookie) -> Result<()> {
    let shared = registry().find(id).ok_or(Error::SecurityViolation)?;
    if !shared.auth_read(cookie) {
        return Err(Error::SecurityViolation);
    }
    shared.read(offset, buf)
}

/// Write by global id; requires the read-write key.
pub fn write_by_id(id: u64, offset: usize, data: &[u8], cookie: &EntryCookie) -> Result<()> {
    let shared = registry().find(id).ok_or(Error::SecurityViolation)?;
    if !shared.auth_write(cookie) {
        return Err(Error::SecurityViolation);
    }
    shared.write(offset, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_starts_zeroed_and_bounds_are_checked() {
        let cookie = EntryCookie::create();
        let (owner, id) = ShmOwner::create(4096, &cookie).unwrap();
        let mut buf = [0xffu8; 4096];
        read_by_id(id, 0, &mut buf, &cookie).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        let mut oob = [0u8; 4096];
        assert_eq!(
            read_by_id(id, 128, &mut oob, &cookie).unwrap_err(),
            Error::OutOfBounds
        );
        // Offset overflow is out of bounds, not a wraparound read.
        assert_eq!(
            owner.borrow_ref(false).read(usize::MAX - 2, &mut oob[..8]).unwrap_err(),
            Error::OutOfBounds
        );
    }

    #[test]
    fn ro_ref_cannot_write_rw_ref_can() {
        let cookie = EntryCookie::create();
        let (owner, _id) = ShmOwner::create(4096, &cookie).unwrap();
        let ro = owner.borrow_ref(false);
        let rw = owner.borrow_ref(true);
        let fill = [0xaau8; 4096];
        assert_eq!(ro.write(0, &fill).unwrap_err(), Error::InvalidHandleType);
        rw.write(0, &fill).unwrap();
        let mut via_ro = [0u8; 4096];
        ro.read(0, &mut via_ro).unwrap();
        assert!(via_ro.iter().all(|&b| b == 0xaa));
        let mut via_rw = [0u8; 4096];
        rw.read(0, &mut via_rw).unwrap();
        assert!(via_rw.iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn id_access_authenticates_keys() {
        let creator = EntryCookie::create();
        let stranger = EntryCookie::create();
        let (owner, id) = ShmOwner::create(64, &creator).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(
            read_by_id(id, 0, &mut buf, &stranger).unwrap_err(),
            Error::SecurityViolation
        );
        // Open reads to everybody; writes stay with the creator.
        owner.drop_ownership(false);
        read_by_id(id, 0, &mut buf, &stranger).unwrap();
        assert_eq!(
            write_by_id(id, 0, &buf, &stranger).unwrap_err(),
            Error::SecurityViolation
        );
        write_by_id(id, 0, &buf, &creator).unwrap();
    }

    #[test]
    fn group_key_grants_rw() {
        let creator = EntryCookie::create();
        let member = EntryCookie::create();
        let group = GroupCookie::create();
        member.join(&group).unwrap();
        let (owner, id) = ShmOwner::create(64, &creator).unwrap();
        owner.give_ownership_to_group(&group, true);
        let buf = [1u8; 8];
        write_by_id(id, 8, &buf, &member).unwrap();
        // The creator lost the write key when it moved to the group.
        assert_eq!(
            write_by_id(id, 0, &buf, &creator).unwrap_err(),
            Error::SecurityViolation
        );
    }

    #[test]
    fn owner_drop_unregisters_the_id() {
        let cookie = EntryCookie::create();
        let (owner, id) = ShmOwner::create(32, &cookie).unwrap();
        let rref = owner.borrow_ref(false);
        drop(owner);
        let mut buf = [0u8; 4];
        assert_eq!(
            read_by_id(id, 0, &mut buf, &cookie).unwrap_err(),
            Error::SecurityViolation
        );
        // Borrowed refs still reach the buffer.
        rref.read(0, &mut buf).unwrap();
    }
}
