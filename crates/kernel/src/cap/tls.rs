//! Entry-local key/value storage.

use crate::collections::IntMap;
use crate::config::TLS_BUCKETS;
use crate::error::Result;
use crate::sync::Mutex;

pub struct TlsTable {
    keys: Mutex<IntMap<u64>>,
}

impl TlsTable {
    pub fn new() -> TlsTable {
        TlsTable {
            keys: Mutex::new(IntMap::with_buckets(TLS_BUCKETS)),
        }
    }

    pub fn set_key(&self, key: u64, value: u64) -> Result<()> {
        self.keys.lock().insert(key, value);
        Ok(())
    }

    /// Missing keys read as zero.
    pub fn get_key(&self, key: u64) -> u64 {
        self.keys.lock().get(key).copied().unwrap_or(0)
    }
}

impl Default for TlsTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_and_missing_key() {
        let tls = TlsTable::new();
        tls.set_key(0xcafebabe_deadbeef, 0xdeadbeef_cafebabe).unwrap();
        tls.set_key(0x0000_0000_ebad_f000, 0xaaaa_aaaa_bbbb_bbbb).unwrap();
        assert_eq!(tls.get_key(0xcafebabe_deadbeef), 0xdeadbeef_cafebabe);
        assert_eq!(tls.get_key(0x0000_0000_ebad_f000), 0xaaaa_aaaa_bbbb_bbbb);
        assert_eq!(tls.get_key(0xaaaa_bbbb_cccc_dddd), 0);
    }

    #[test]
    fn overwrite_replaces_value() {
        let tls = TlsTable::new();
        tls.set_key(7, 1).unwrap();
        tls.set_key(7, 2).unwrap();
        assert_eq!(tls.get_key(7), 2);
    }
}
