//! Backup region maintenance: a raw mirror of the management area.
//!
//! The backup region is sized exactly like `[HEADER_OFF, DATA_OFF)` and
//! holds a byte-for-byte copy of the header and index. Data blocks are not
//! mirrored; index corruption leaves them intact on media, so restoring
//! the management area alone brings every prior value back.

use crate::config::{BACKUP_OFF, BACKUP_SIZE, BUFFER_SIZE, HEADER_OFF, SYSTEM_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::port::NvmPort;
use crate::store::header::SystemHeader;
use crate::store::{Store, StoreState};

impl<P: NvmPort> Store<'_, P> {
    /// Persists the mirrors and refreshes the backup region from media.
    pub fn backup_all(&mut self) -> Result<()> {
        if let Err(err) = self.ensure_ready() {
            return Err(self.fail("backup_all", 0, err));
        }
        if let Err(err) = self.save_index().and_then(|_| self.save_header()) {
            return Err(self.fail("backup_all", 0, err));
        }
        if let Err(err) = self.copy_management_to_backup() {
            return Err(self.fail("backup_all", 0, err));
        }
        debug!("management area backed up");
        Ok(())
    }

    /// Validates the backup copy and restores it over the primary
    /// management area, then remounts from it.
    pub fn restore_from_backup(&mut self) -> Result<()> {
        if self.state == StoreState::Uninitialized {
            return Err(self.fail("restore_from_backup", 0, Error::InvalidState));
        }
        if let Err(err) = self.try_restore() {
            return Err(self.fail("restore_from_backup", 0, err));
        }
        self.state = StoreState::Ready;
        Ok(())
    }

    /// Restore workhorse, shared with `init`. The backup header must
    /// validate (magic, format, CRC) and carry this build's geometry
    /// before a single primary byte is overwritten.
    pub(super) fn try_restore(&mut self) -> Result<()> {
        let mut raw = [0u8; SYSTEM_HEADER_SIZE];
        self.port
            .nvm_read(BACKUP_OFF, &mut raw)
            .map_err(|_| Error::Generic)?;
        let header = SystemHeader::parse(&raw, self.magic)?;
        header.verify_geometry()?;

        self.copy_region(BACKUP_OFF, HEADER_OFF, BACKUP_SIZE as usize)?;

        self.header = self.load_header()?;
        self.index = self.load_index()?;
        self.repair_tag_count();
        warn!("management area restored from backup");
        Ok(())
    }

    /// Raw chunked copy of the management area into the backup region,
    /// exactly as it currently reads on media.
    pub(super) fn copy_management_to_backup(&mut self) -> Result<()> {
        self.copy_region(HEADER_OFF, BACKUP_OFF, BACKUP_SIZE as usize)
    }

    fn copy_region(&mut self, src: u32, dst: u32, len: usize) -> Result<()> {
        let mut remaining = len;
        let mut read_at = src;
        let mut write_at = dst;
        while remaining > 0 {
            let n = remaining.min(BUFFER_SIZE);
            self.port
                .nvm_read(read_at, &mut self.scratch[..n])
                .map_err(|_| Error::Generic)?;
            self.port
                .nvm_write(write_at, &self.scratch[..n])
                .map_err(|_| Error::Generic)?;
            read_at += n as u32;
            write_at += n as u32;
            remaining -= n;
        }
        Ok(())
    }
}
