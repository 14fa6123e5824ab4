//! Compile-time geometry and tuning knobs.
//!
//! The device is modeled as a flat byte array partitioned into four regions:
//! system header, index table, data region and backup region. The offsets
//! below must keep that order; the cross-checks at the bottom of this file
//! refuse to compile a layout that cannot hold its own structures.

/* REGION GEOMETRY */

/// Total NVM bytes presented by the port.
pub const DEVICE_SIZE: usize = 128 * 1024;
/// System header region offset.
pub const HEADER_OFF: u32 = 0;
/// Index table region offset.
pub const INDEX_OFF: u32 = 256;
/// Data region offset. The gap after the index table is reserved.
pub const DATA_OFF: u32 = 2048;
/// Backup region size: a byte-for-byte mirror of `[HEADER_OFF, DATA_OFF)`.
pub const BACKUP_SIZE: u32 = DATA_OFF - HEADER_OFF;
/// Backup region offset, at the very end of the device.
pub const BACKUP_OFF: u32 = DEVICE_SIZE as u32 - BACKUP_SIZE;
/// Bytes available for data blocks.
pub const DATA_REGION_SIZE: u32 = BACKUP_OFF - DATA_OFF;

/* CAPACITY */

/// Index capacity in slots.
pub const MAX_TAGS: usize = 128;
/// In-RAM scratch buffer size, used for chunked moves and verification.
pub const BUFFER_SIZE: usize = 512;
/// Stream session pool size.
pub const MAX_STREAM_HANDLES: usize = 4;
/// Error ledger ring depth.
pub const ERROR_HISTORY_SIZE: usize = 16;

/* ON-MEDIA FORMAT */

/// System identifier, "FVLT" on media.
pub const SYSTEM_MAGIC: u32 = 0x544C_5646;
/// Format major version; readers reject a different major.
pub const FORMAT_MAJOR: u8 = 1;
/// Format minor version; readers accept a minor at or below this.
pub const FORMAT_MINOR: u8 = 0;
/// major.minor packed in high/low bytes.
pub const FORMAT_VERSION: u16 = (FORMAT_MAJOR as u16) << 8 | FORMAT_MINOR as u16;

/// Persisted system header size, including its trailing CRC.
pub const SYSTEM_HEADER_SIZE: usize = 256;
/// Persisted index entry size.
pub const INDEX_ENTRY_SIZE: usize = 8;
/// Persisted index table size: all slots plus the trailing CRC.
pub const INDEX_TABLE_SIZE: usize = MAX_TAGS * INDEX_ENTRY_SIZE + 2;
/// Data block header size.
pub const BLOCK_HEADER_SIZE: usize = 14;
/// Data block trailing CRC size.
pub const BLOCK_TRAILER_SIZE: usize = 2;

/// Total on-media size of a block carrying `payload_len` bytes.
pub const fn block_total_size(payload_len: usize) -> usize {
    BLOCK_HEADER_SIZE + payload_len + BLOCK_TRAILER_SIZE
}

/* TUNING */

/// Auto-defragmentation threshold, percent of the consumed data region that
/// is dead. Only consulted with the `auto-defrag` feature.
pub const AUTO_DEFRAG_THRESHOLD_PERCENT: u32 = 25;

const_assert!(DEVICE_SIZE >= 64 * 1024);
const_assert!(MAX_TAGS <= 256);
const_assert!(BUFFER_SIZE >= 256);
const_assert!(MAX_STREAM_HANDLES >= 1);
const_assert!(HEADER_OFF < INDEX_OFF);
const_assert!(INDEX_OFF < DATA_OFF);
const_assert!(DATA_OFF < BACKUP_OFF);
const_assert!(HEADER_OFF as usize + SYSTEM_HEADER_SIZE <= INDEX_OFF as usize);
const_assert!(INDEX_OFF as usize + INDEX_TABLE_SIZE <= DATA_OFF as usize);
const_assert_eq!(BACKUP_OFF as usize + BACKUP_SIZE as usize, DEVICE_SIZE);
