//! The 256-byte system header: geometry, bookkeeping scalars, self-CRC.
//!
//! Persisted little-endian and packed; the byte layout is spelled out by
//! the serializer below rather than by a host struct, so the mirror struct
//! is free to stay plain Rust.

use crate::config::{
    DATA_OFF, DATA_REGION_SIZE, FORMAT_MAJOR, FORMAT_MINOR, FORMAT_VERSION, SYSTEM_HEADER_SIZE,
};
use crate::error::{Error, Result};
use crate::util::crc16::crc16;

/// Offset of the trailing self-CRC; everything before it is covered.
const CRC_OFF: usize = SYSTEM_HEADER_SIZE - 2;

/// In-RAM mirror of the persisted system header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemHeader {
    pub magic: u32,
    pub format_version: u16,
    pub tag_count: u16,
    pub data_region_start: u32,
    pub data_region_size: u32,
    pub next_free_addr: u32,
    pub total_writes: u32,
    pub last_update_time: u32,
    pub free_space: u32,
    pub used_space: u32,
    pub fragment_count: u32,
    pub fragment_size: u32,
}

impl SystemHeader {
    /// Header for a freshly formatted store.
    pub fn fresh(magic: u32, now: u32) -> Self {
        Self {
            magic,
            format_version: FORMAT_VERSION,
            tag_count: 0,
            data_region_start: DATA_OFF,
            data_region_size: DATA_REGION_SIZE,
            next_free_addr: DATA_OFF,
            total_writes: 0,
            last_update_time: now,
            free_space: DATA_REGION_SIZE,
            used_space: 0,
            fragment_count: 0,
            fragment_size: 0,
        }
    }

    /// Serializes the header, recomputing the trailing CRC.
    pub fn encode(&self) -> [u8; SYSTEM_HEADER_SIZE] {
        let mut raw = [0u8; SYSTEM_HEADER_SIZE];
        raw[0..4].copy_from_slice(&self.magic.to_le_bytes());
        raw[4..6].copy_from_slice(&self.format_version.to_le_bytes());
        raw[6..8].copy_from_slice(&self.tag_count.to_le_bytes());
        raw[8..12].copy_from_slice(&self.data_region_start.to_le_bytes());
        raw[12..16].copy_from_slice(&self.data_region_size.to_le_bytes());
        raw[16..20].copy_from_slice(&self.next_free_addr.to_le_bytes());
        raw[20..24].copy_from_slice(&self.total_writes.to_le_bytes());
        raw[24..28].copy_from_slice(&self.last_update_time.to_le_bytes());
        raw[28..32].copy_from_slice(&self.free_space.to_le_bytes());
        raw[32..36].copy_from_slice(&self.used_space.to_le_bytes());
        raw[36..40].copy_from_slice(&self.fragment_count.to_le_bytes());
        raw[40..44].copy_from_slice(&self.fragment_size.to_le_bytes());
        // [44..CRC_OFF] reserved, zero
        let crc = crc16(&raw[..CRC_OFF]);
        raw[CRC_OFF..].copy_from_slice(&crc.to_le_bytes());
        raw
    }

    /// Parses and verifies a persisted header against `expected_magic`.
    ///
    /// Check order is fixed: magic (`Corrupted`), format major and minor
    /// (`Version`; same major with minor at or below the runtime's is
    /// accepted), then the self-CRC (`CrcFailed`).
    pub fn parse(raw: &[u8], expected_magic: u32) -> Result<Self> {
        if raw.len() < SYSTEM_HEADER_SIZE {
            return Err(Error::InvalidParam);
        }
        let magic = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        if magic != expected_magic {
            return Err(Error::Corrupted);
        }
        let format_version = u16::from_le_bytes(raw[4..6].try_into().unwrap());
        let (major, minor) = ((format_version >> 8) as u8, format_version as u8);
        if major != FORMAT_MAJOR || minor > FORMAT_MINOR {
            return Err(Error::Version);
        }
        let stored = u16::from_le_bytes(raw[CRC_OFF..SYSTEM_HEADER_SIZE].try_into().unwrap());
        if crc16(&raw[..CRC_OFF]) != stored {
            return Err(Error::CrcFailed);
        }
        Ok(Self {
            magic,
            format_version,
            tag_count: u16::from_le_bytes(raw[6..8].try_into().unwrap()),
            data_region_start: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            data_region_size: u32::from_le_bytes(raw[12..16].try_into().unwrap()),
            next_free_addr: u32::from_le_bytes(raw[16..20].try_into().unwrap()),
            total_writes: u32::from_le_bytes(raw[20..24].try_into().unwrap()),
            last_update_time: u32::from_le_bytes(raw[24..28].try_into().unwrap()),
            free_space: u32::from_le_bytes(raw[28..32].try_into().unwrap()),
            used_space: u32::from_le_bytes(raw[32..36].try_into().unwrap()),
            fragment_count: u32::from_le_bytes(raw[36..40].try_into().unwrap()),
            fragment_size: u32::from_le_bytes(raw[40..44].try_into().unwrap()),
        })
    }

    /// Structural sanity beyond the CRC: the persisted geometry must match
    /// the compiled-in geometry, and the bookkeeping must fit the region.
    pub fn verify_geometry(&self) -> Result<()> {
        if self.data_region_start != DATA_OFF || self.data_region_size != DATA_REGION_SIZE {
            return Err(Error::Corrupted);
        }
        if self.next_free_addr < self.data_region_start
            || self.next_free_addr > self.data_region_start + self.data_region_size
        {
            return Err(Error::Corrupted);
        }
        Ok(())
    }
}

const_assert_eq!(SYSTEM_HEADER_SIZE, 256);
