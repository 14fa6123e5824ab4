//! Bump allocation over the data region, with rollback snapshots.
//!
//! The allocator state lives in the system header's bookkeeping scalars; a
//! mutating operation captures them once up front and either commits (drops
//! the snapshot) or restores them wholesale. FRAM needs no free-list: space
//! behind the bump pointer is reclaimed only by defragmentation.

use crate::config::BACKUP_OFF;
use crate::store::header::SystemHeader;

/// Sentinel returned by [`allocate`] when the region cannot hold `n` bytes.
pub const ALLOC_FAILED: u32 = 0;

/// The six bookkeeping scalars saved at the start of a mutating operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    next_free_addr: u32,
    used_space: u32,
    free_space: u32,
    fragment_count: u32,
    fragment_size: u32,
    tag_count: u16,
}

impl Snapshot {
    pub fn capture(header: &SystemHeader) -> Self {
        Self {
            next_free_addr: header.next_free_addr,
            used_space: header.used_space,
            free_space: header.free_space,
            fragment_count: header.fragment_count,
            fragment_size: header.fragment_size,
            tag_count: header.tag_count,
        }
    }

    pub fn restore(&self, header: &mut SystemHeader) {
        header.next_free_addr = self.next_free_addr;
        header.used_space = self.used_space;
        header.free_space = self.free_space;
        header.fragment_count = self.fragment_count;
        header.fragment_size = self.fragment_size;
        header.tag_count = self.tag_count;
    }
}

/// Returns the address for `n` fresh bytes, or [`ALLOC_FAILED`] when the
/// region up to `BACKUP_OFF` is exhausted.
pub fn allocate(header: &mut SystemHeader, n: u32) -> u32 {
    let addr = header.next_free_addr;
    match addr.checked_add(n) {
        Some(end) if end <= BACKUP_OFF => {
            header.next_free_addr = end;
            addr
        }
        _ => ALLOC_FAILED,
    }
}

/// Books `n` bytes as live. `free_space` is the derived complement.
pub fn increase_used(header: &mut SystemHeader, n: u32) {
    header.used_space = header.used_space.saturating_add(n);
    header.free_space = header.data_region_size.saturating_sub(header.used_space);
}

/// Releases `n` live bytes. Clamps at zero; `used_space` must never wrap.
pub fn reduce_used(header: &mut SystemHeader, n: u32) {
    header.used_space = header.used_space.saturating_sub(n);
    header.free_space = header.data_region_size.saturating_sub(header.used_space);
}

/// Books a dead extent awaiting defragmentation.
pub fn add_fragment(header: &mut SystemHeader, size: u32) {
    header.fragment_count = header.fragment_count.saturating_add(1);
    header.fragment_size = header.fragment_size.saturating_add(size);
}
