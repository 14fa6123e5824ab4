//! Lazy structural migration.
//!
//! A record persisted under an older schema version is upgraded in the
//! caller's buffer by the schema's migrate function the moment it is read,
//! then written back through the normal write path, which stamps the new
//! version into the index entry. Reads never surface data loss: when a
//! migrator fails for any reason other than a short buffer, the original
//! payload is re-read and returned, and the failure lands in the ledger.

use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::port::NvmPort;
#[cfg(feature = "lazy-migrate-read")]
use crate::schema::SchemaEntry;
use crate::store::Store;

impl<P: NvmPort> Store<'_, P> {
    /// Read-path hook: `entry_version` differs from the schema's.
    #[cfg(feature = "lazy-migrate-read")]
    pub(super) fn migrate_on_read(
        &mut self,
        tag: u16,
        entry_version: u8,
        schema_entry: &SchemaEntry,
        addr: u32,
        buf: &mut [u8],
        len: usize,
    ) -> Result<usize> {
        let target = schema_entry.version;
        if entry_version > target {
            // downgrades are refused outright
            return Err(self.fail("migrate", tag, Error::Version));
        }
        let migrate = match schema_entry.migrate {
            Some(f) => f,
            None => return Err(self.fail("migrate", tag, Error::Version)),
        };
        let mut new_len = len;
        match migrate(buf, &mut new_len, entry_version, target) {
            Ok(()) => {}
            Err(err) => {
                if let Error::NoBufferMemory { .. } = err {
                    // the caller can widen the buffer and retry
                    return Err(self.fail("migrate", tag, err));
                }
                let _ = self.fail("migrate", tag, err);
                return self.reread_original(tag, addr, buf);
            }
        }
        if new_len == 0 || new_len > schema_entry.max_length as usize {
            // migrator produced a nonsensical size
            let _ = self.fail("migrate", tag, Error::InvalidParam);
            return self.reread_original(tag, addr, buf);
        }
        // persist the upgrade; the index save inside write() bumps the
        // stored version. A write-back failure still returns the upgraded
        // bytes, the next read will retry the persist.
        if let Err(err) = self.write(tag, &buf[..new_len]) {
            let _ = self.fail("migrate_writeback", tag, err);
        } else {
            info!(
                "tag {:#06x} migrated v{} -> v{}",
                tag, entry_version, target
            );
        }
        Ok(new_len)
    }

    #[cfg(feature = "lazy-migrate-read")]
    fn reread_original(&mut self, tag: u16, addr: u32, buf: &mut [u8]) -> Result<usize> {
        match self.read_block(addr, buf) {
            Ok(n) => Ok(n),
            Err(err) => Err(self.fail("read", tag, err)),
        }
    }

    /// Eagerly upgrades every live record whose persisted version trails
    /// its schema entry. Returns the number of records upgraded; records
    /// that cannot be migrated are skipped and recorded in the ledger.
    pub fn migrate_all(&mut self) -> Result<usize> {
        if let Err(err) = self.ensure_ready() {
            return Err(self.fail("migrate_all", 0, err));
        }
        let slots: Vec<usize> = self.index.live_slots().collect();
        let mut upgraded = 0;
        for slot in slots {
            let entry = *self.index.entry(slot);
            let schema_entry = match self.schema.lookup(entry.tag) {
                Some(e) => *e,
                None => continue,
            };
            if entry.version == schema_entry.version {
                continue;
            }
            if entry.version > schema_entry.version {
                let _ = self.fail("migrate_all", entry.tag, Error::Version);
                continue;
            }
            let migrate = match schema_entry.migrate {
                Some(f) => f,
                None => {
                    let _ = self.fail("migrate_all", entry.tag, Error::Version);
                    continue;
                }
            };
            let mut buf = vec![0u8; schema_entry.max_length as usize];
            let mut len = match self.read_block(entry.data_addr, &mut buf) {
                Ok(n) => n,
                Err(err) => {
                    let _ = self.fail("migrate_all", entry.tag, err);
                    continue;
                }
            };
            if let Err(err) = migrate(&mut buf, &mut len, entry.version, schema_entry.version) {
                let _ = self.fail("migrate_all", entry.tag, err);
                continue;
            }
            if len == 0 || len > schema_entry.max_length as usize {
                let _ = self.fail("migrate_all", entry.tag, Error::InvalidParam);
                continue;
            }
            match self.write(entry.tag, &buf[..len]) {
                Ok(()) => upgraded += 1,
                Err(err) => {
                    let _ = self.fail("migrate_all", entry.tag, err);
                }
            }
        }
        Ok(upgraded)
    }
}
