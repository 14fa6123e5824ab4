//! The fixed-size tag index: `MAX_TAGS` 8-byte slots plus a trailing CRC.
//!
//! A slot with `tag == 0` is empty. Lookup is a linear scan; a slot-hint
//! cache keyed by schema position short-circuits the common case, but the
//! cache is advisory only: whenever the hinted slot disagrees with the tag
//! (the index may predate a firmware update that reordered the schema) the
//! lookup falls back to the scan and the hint is refreshed.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::config::{INDEX_ENTRY_SIZE, INDEX_TABLE_SIZE, MAX_TAGS};
use crate::error::{Error, Result};
use crate::util::crc16::crc16;

bitflags! {
    /// Persisted per-entry flags. Only `VALID` and `DIRTY` are consumed by
    /// the engine; the rest are advisory for the application.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u8 {
        const VALID = 1;
        const DIRTY = 2;
        const BACKUP = 4;
        const ENCRYPTED = 8;
        const CRITICAL = 16;
    }
}

/// One index slot: `{tag:16, flags:8, version:8, data_addr:32}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexEntry {
    pub tag: u16,
    pub flags: EntryFlags,
    pub version: u8,
    pub data_addr: u32,
}

impl IndexEntry {
    pub fn is_empty(&self) -> bool {
        self.tag == 0
    }

    /// Live entries are the readable ones: occupied, valid, not clobbered.
    pub fn is_live(&self) -> bool {
        self.tag != 0
            && self.flags.contains(EntryFlags::VALID)
            && !self.flags.contains(EntryFlags::DIRTY)
    }

    fn encode(&self, raw: &mut [u8]) {
        raw[0..2].copy_from_slice(&self.tag.to_le_bytes());
        raw[2] = self.flags.bits();
        raw[3] = self.version;
        raw[4..8].copy_from_slice(&self.data_addr.to_le_bytes());
    }

    fn parse(raw: &[u8]) -> Self {
        Self {
            tag: u16::from_le_bytes(raw[0..2].try_into().unwrap()),
            flags: EntryFlags::from_bits_retain(raw[2]),
            version: raw[3],
            data_addr: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
        }
    }
}

/// In-RAM mirror of the persisted index table.
pub struct IndexTable {
    entries: Vec<IndexEntry>,
    /// Schema position -> slot + 1; 0 means no hint.
    hints: [u16; MAX_TAGS],
}

impl IndexTable {
    pub fn empty() -> Self {
        Self {
            entries: vec![IndexEntry::default(); MAX_TAGS],
            hints: [0; MAX_TAGS],
        }
    }

    /// Parses a persisted table, verifying the trailing CRC.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < INDEX_TABLE_SIZE {
            return Err(Error::InvalidParam);
        }
        let body = MAX_TAGS * INDEX_ENTRY_SIZE;
        let stored = u16::from_le_bytes(raw[body..body + 2].try_into().unwrap());
        if crc16(&raw[..body]) != stored {
            return Err(Error::CrcFailed);
        }
        let mut table = Self::empty();
        for (slot, chunk) in raw[..body].chunks_exact(INDEX_ENTRY_SIZE).enumerate() {
            table.entries[slot] = IndexEntry::parse(chunk);
        }
        Ok(table)
    }

    /// Serializes the table, recomputing the trailing CRC.
    pub fn encode(&self) -> Vec<u8> {
        let mut raw = vec![0u8; INDEX_TABLE_SIZE];
        for (slot, entry) in self.entries.iter().enumerate() {
            entry.encode(&mut raw[slot * INDEX_ENTRY_SIZE..(slot + 1) * INDEX_ENTRY_SIZE]);
        }
        let body = MAX_TAGS * INDEX_ENTRY_SIZE;
        let crc = crc16(&raw[..body]);
        raw[body..body + 2].copy_from_slice(&crc.to_le_bytes());
        raw
    }

    pub fn entry(&self, slot: usize) -> &IndexEntry {
        &self.entries[slot]
    }

    pub fn entry_mut(&mut self, slot: usize) -> &mut IndexEntry {
        &mut self.entries[slot]
    }

    /// Finds the live slot for `tag`. `schema_pos`, when known, keys the
    /// hint cache; a stale hint falls through to the linear scan.
    pub fn find(&mut self, tag: u16, schema_pos: Option<usize>) -> Option<usize> {
        if tag == 0 {
            return None;
        }
        if let Some(pos) = schema_pos {
            if pos < MAX_TAGS && self.hints[pos] != 0 {
                let slot = self.hints[pos] as usize - 1;
                let entry = &self.entries[slot];
                if entry.tag == tag && entry.is_live() {
                    return Some(slot);
                }
                self.hints[pos] = 0;
            }
        }
        let slot = self
            .entries
            .iter()
            .position(|e| e.tag == tag && e.is_live())?;
        if let Some(pos) = schema_pos {
            if pos < MAX_TAGS {
                self.hints[pos] = (slot + 1) as u16;
            }
        }
        Some(slot)
    }

    pub fn find_free_slot(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.is_empty())
    }

    /// Occupies a free slot for `tag`. The caller maintains `tag_count`.
    pub fn add(&mut self, tag: u16, data_addr: u32, version: u8) -> Result<usize> {
        let slot = self.find_free_slot().ok_or(Error::NoIndexSpace)?;
        self.entries[slot] = IndexEntry {
            tag,
            flags: EntryFlags::VALID,
            version,
            data_addr,
        };
        Ok(slot)
    }

    /// Repoints an existing slot at a new block.
    pub fn update(&mut self, slot: usize, data_addr: u32, version: u8) {
        let entry = &mut self.entries[slot];
        entry.data_addr = data_addr;
        entry.version = version;
        entry.flags = EntryFlags::VALID;
    }

    pub fn remove(&mut self, slot: usize) {
        self.entries[slot] = IndexEntry::default();
        for hint in self.hints.iter_mut() {
            if *hint as usize == slot + 1 {
                *hint = 0;
            }
        }
    }

    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_live()).count()
    }

    pub fn live_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_live())
            .map(|(slot, _)| slot)
    }

    pub(crate) fn invalidate_hints(&mut self) {
        self.hints = [0; MAX_TAGS];
    }

    /// Compacts the live entries to the front of the array in ascending
    /// `data_addr` order and clears the trailing slots. Insertion sort:
    /// the table is near-sorted in the common case. Returns the live
    /// count, which is also the number of leading occupied slots.
    pub fn sort_live_by_addr(&mut self) -> usize {
        let mut write_idx = 0;
        for i in 0..MAX_TAGS {
            if self.entries[i].is_live() {
                if i != write_idx {
                    self.entries[write_idx] = self.entries[i];
                }
                write_idx += 1;
            }
        }
        for entry in &mut self.entries[write_idx..] {
            *entry = IndexEntry::default();
        }
        for i in 1..write_idx {
            let key = self.entries[i];
            let mut j = i;
            while j > 0 && self.entries[j - 1].data_addr > key.data_addr {
                self.entries[j] = self.entries[j - 1];
                j -= 1;
            }
            self.entries[j] = key;
        }
        self.invalidate_hints();
        write_idx
    }
}

const_assert_eq!(INDEX_ENTRY_SIZE, 8);
