//! Security cookies.
//!
//! Every API entry carries an entry cookie: its own key plus the keys of
//! the groups it joined. Capability references and shared-memory objects
//! store bare keys; authentication asks whether the entry's cookie covers
//! the stored key. Two keys are reserved: the kernel-only key that nobody
//! authenticates against, and the universal key that everybody does.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::sync::Mutex;

pub type CookieKey = u64;

/// Authenticates nobody.
pub const KEY_KERNEL_ONLY: CookieKey = 0;

/// Authenticates anybody.
pub const KEY_UNIVERSAL: CookieKey = 1;

static NEXT_KEY: AtomicU64 = AtomicU64::new(2);

fn fresh_key() -> CookieKey {
    NEXT_KEY.fetch_add(1, Ordering::Relaxed)
}

/// A group's authenticator: one key, handed to entries via `join`.
pub struct GroupCookie {
    key: CookieKey,
}

impl GroupCookie {
    pub fn create() -> Arc<GroupCookie> {
        Arc::new(GroupCookie { key: fresh_key() })
    }

    pub fn key(&self) -> CookieKey {
        self.key
    }
}

/// A thread's authenticator: its own key plus accumulated group keys.
pub struct EntryCookie {
    key: CookieKey,
    /// Group keys; vacated slots hold the kernel-only key and are reused.
    groups: Mutex<Vec<CookieKey>>,
}

impl EntryCookie {
    pub fn create() -> Arc<EntryCookie> {
        Arc::new(EntryCookie {
            key: fresh_key(),
            groups: Mutex::new(Vec::new()),
        })
    }

    pub fn key(&self) -> CookieKey {
        self.key
    }

    /// Add the group's key to this entry. Idempotent.
    pub fn join(&self, group: &GroupCookie) -> Result<()> {
        let mut groups = self.groups.lock();
        if groups.iter().any(|&k| k == group.key) {
            return Ok(());
        }
        if let Some(slot) = groups.iter_mut().find(|k| **k == KEY_KERNEL_ONLY) {
            *slot = group.key;
        } else {
            groups.push(group.key);
        }
        Ok(())
    }

    /// Remove the group's key. Removing a key that was never joined is a
    /// no-op.
    pub fn leave(&self, group: &GroupCookie) {
        let mut groups = self.groups.lock();
        if let Some(slot) = groups.iter_mut().find(|k| **k == group.key) {
            *slot = KEY_KERNEL_ONLY;
        }
    }

    /// Does this entry's cookie cover `key`?
    pub fn authenticates(&self, key: CookieKey) -> bool {
        if key == KEY_UNIVERSAL || key == self.key {
            return true;
        }
        if key == KEY_KERNEL_ONLY {
            return false;
        }
        self.groups.lock().iter().any(|&k| k == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_keys() {
        let entry = EntryCookie::create();
        assert!(entry.authenticates(KEY_UNIVERSAL));
        assert!(!entry.authenticates(KEY_KERNEL_ONLY));
        assert!(entry.authenticates(entry.key()));
    }

    #[test]
    fn group_membership_gates_auth() {
        let entry = EntryCookie::create();
        let group = GroupCookie::create();
        assert!(!entry.authenticates(group.key()));
        entry.join(&group).unwrap();
        assert!(entry.authenticates(group.key()));
        // Idempotent join, then leave.
        entry.join(&group).unwrap();
        entry.leave(&group);
        assert!(!entry.authenticates(group.key()));
    }

    #[test]
    fn vacated_group_slots_are_reused() {
        let entry = EntryCookie::create();
        let a = GroupCookie::create();
        let b = GroupCookie::create();
        entry.join(&a).unwrap();
        entry.leave(&a);
        entry.join(&b).unwrap();
        assert_eq!(entry.groups.lock().len(), 1);
        assert!(entry.authenticates(b.key()));
        assert!(!entry.authenticates(a.key()));
    }

    #[test]
    fn keys_are_unique() {
        let a = EntryCookie::create();
        let b = EntryCookie::create();
        let g = GroupCookie::create();
        assert_ne!(a.key(), b.key());
        assert_ne!(a.key(), g.key());
        assert!(!a.authenticates(b.key()));
    }
}
