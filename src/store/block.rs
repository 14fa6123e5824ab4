//! Data block codec: `{14-byte header, payload, trailing CRC-16}`.
//!
//! The trailing CRC commits the *block*; visibility is committed separately
//! by the index save. Block writes are three sequential transport writes
//! and carry no atomicity of their own.

use crate::config::{
    block_total_size, BACKUP_OFF, BLOCK_HEADER_SIZE, BUFFER_SIZE, DATA_OFF,
};
use crate::error::{Error, Result};
use crate::port::NvmPort;
use crate::store::Store;
use crate::util::crc16::Crc16;

/// Parsed data block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub tag: u16,
    pub length: u16,
    pub version: u8,
    pub flags: u8,
    pub timestamp: u32,
    pub write_count: u32,
}

impl BlockHeader {
    pub fn encode(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut raw = [0u8; BLOCK_HEADER_SIZE];
        raw[0..2].copy_from_slice(&self.tag.to_le_bytes());
        raw[2..4].copy_from_slice(&self.length.to_le_bytes());
        raw[4] = self.version;
        raw[5] = self.flags;
        raw[6..10].copy_from_slice(&self.timestamp.to_le_bytes());
        raw[10..14].copy_from_slice(&self.write_count.to_le_bytes());
        raw
    }

    pub fn parse(raw: &[u8; BLOCK_HEADER_SIZE]) -> Self {
        Self {
            tag: u16::from_le_bytes(raw[0..2].try_into().unwrap()),
            length: u16::from_le_bytes(raw[2..4].try_into().unwrap()),
            version: raw[4],
            flags: raw[5],
            timestamp: u32::from_le_bytes(raw[6..10].try_into().unwrap()),
            write_count: u32::from_le_bytes(raw[10..14].try_into().unwrap()),
        }
    }

    /// On-media size of the whole block this header describes.
    pub fn total_size(&self) -> u32 {
        block_total_size(self.length as usize) as u32
    }
}

const_assert_eq!(BLOCK_HEADER_SIZE, 14);

/// A block must lie wholly inside the data region.
fn check_extent(addr: u32, total: u32) -> Result<()> {
    if addr < DATA_OFF || addr.checked_add(total).map_or(true, |end| end > BACKUP_OFF) {
        return Err(Error::Corrupted);
    }
    Ok(())
}

impl<P: NvmPort> Store<'_, P> {
    /// Reads and parses the 14-byte header at `addr` without validating it.
    pub(super) fn read_block_header(&mut self, addr: u32) -> Result<BlockHeader> {
        let mut raw = [0u8; BLOCK_HEADER_SIZE];
        self.port
            .nvm_read(addr, &mut raw)
            .map_err(|_| Error::Generic)?;
        Ok(BlockHeader::parse(&raw))
    }

    /// Writes a complete block at `addr`.
    ///
    /// The write counter carries over from a block previously stored for
    /// the same tag at this address; anything else restarts it at 1.
    pub(super) fn write_block(
        &mut self,
        tag: u16,
        version: u8,
        payload: &[u8],
        addr: u32,
    ) -> Result<()> {
        let write_count = match self.read_block_header(addr) {
            Ok(old) if old.tag == tag => old.write_count.wrapping_add(1),
            _ => 1,
        };
        let header = BlockHeader {
            tag,
            length: payload.len() as u16,
            version,
            flags: 0,
            timestamp: self.port.time_seconds(),
            write_count,
        };
        let raw = header.encode();
        let mut crc = Crc16::new();
        crc.update(&raw);
        crc.update(payload);

        self.port.nvm_write(addr, &raw).map_err(|_| Error::Generic)?;
        self.port
            .nvm_write(addr + BLOCK_HEADER_SIZE as u32, payload)
            .map_err(|_| Error::Generic)?;
        self.port
            .nvm_write(
                addr + (BLOCK_HEADER_SIZE + payload.len()) as u32,
                &crc.finish().to_le_bytes(),
            )
            .map_err(|_| Error::Generic)?;
        trace!(
            "block write: tag {:#06x} len {} at {:#x} (write #{})",
            tag,
            payload.len(),
            addr,
            write_count
        );
        Ok(())
    }

    /// Reads the block at `addr` into `buf` and verifies its CRC.
    ///
    /// Returns the payload length. A short buffer fails with the required
    /// size so the caller can widen and retry.
    pub(super) fn read_block(&mut self, addr: u32, buf: &mut [u8]) -> Result<usize> {
        let mut raw = [0u8; BLOCK_HEADER_SIZE];
        self.port
            .nvm_read(addr, &mut raw)
            .map_err(|_| Error::Generic)?;
        let header = BlockHeader::parse(&raw);
        check_extent(addr, header.total_size())?;
        let length = header.length as usize;
        if length > buf.len() {
            return Err(Error::NoBufferMemory { required: length });
        }
        self.port
            .nvm_read(addr + BLOCK_HEADER_SIZE as u32, &mut buf[..length])
            .map_err(|_| Error::Generic)?;
        let mut trailer = [0u8; 2];
        self.port
            .nvm_read(addr + (BLOCK_HEADER_SIZE + length) as u32, &mut trailer)
            .map_err(|_| Error::Generic)?;

        let mut crc = Crc16::new();
        crc.update(&raw);
        crc.update(&buf[..length]);
        if crc.finish() != u16::from_le_bytes(trailer) {
            return Err(Error::CrcFailed);
        }
        Ok(length)
    }

    /// CRC-checks the block at `addr` in scratch-sized chunks, without a
    /// caller buffer. Also cross-checks the block's tag against the index.
    pub(super) fn verify_block(&mut self, addr: u32, expected_tag: u16) -> Result<()> {
        let mut raw = [0u8; BLOCK_HEADER_SIZE];
        self.port
            .nvm_read(addr, &mut raw)
            .map_err(|_| Error::Generic)?;
        let header = BlockHeader::parse(&raw);
        if header.tag != expected_tag {
            return Err(Error::Corrupted);
        }
        check_extent(addr, header.total_size())?;

        let mut crc = Crc16::new();
        crc.update(&raw);
        let mut remaining = header.length as usize;
        let mut offset = addr + BLOCK_HEADER_SIZE as u32;
        while remaining > 0 {
            let chunk = remaining.min(BUFFER_SIZE);
            self.port
                .nvm_read(offset, &mut self.scratch[..chunk])
                .map_err(|_| Error::Generic)?;
            crc.update(&self.scratch[..chunk]);
            remaining -= chunk;
            offset += chunk as u32;
        }
        let mut trailer = [0u8; 2];
        self.port
            .nvm_read(offset, &mut trailer)
            .map_err(|_| Error::Generic)?;
        if crc.finish() != u16::from_le_bytes(trailer) {
            return Err(Error::CrcFailed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_pinned() {
        let header = BlockHeader {
            tag: 0x1001,
            length: 0x0203,
            version: 4,
            flags: 0,
            timestamp: 0x0A0B_0C0D,
            write_count: 2,
        };
        let raw = header.encode();
        assert_eq!(&raw[0..2], &[0x01, 0x10]);
        assert_eq!(&raw[2..4], &[0x03, 0x02]);
        assert_eq!(raw[4], 4);
        assert_eq!(&raw[6..10], &[0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(&raw[10..14], &[2, 0, 0, 0]);
        assert_eq!(BlockHeader::parse(&raw), header);
    }

    #[test]
    fn extent_check_rejects_out_of_region_blocks() {
        assert!(check_extent(DATA_OFF, 64).is_ok());
        assert!(check_extent(0, 64).is_err());
        assert!(check_extent(BACKUP_OFF - 10, 64).is_err());
        assert!(check_extent(u32::MAX - 2, 64).is_err());
    }
}
