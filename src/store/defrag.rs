//! Compaction: move live blocks to the start of the data region in
//! ascending address order and reset the fragment bookkeeping.
//!
//! The management area is checkpointed to the backup region first, so an
//! interruption mid-move can be undone with `restore_from_backup`. Blocks
//! only ever move towards lower addresses, which makes the chunked forward
//! copy safe even when source and destination extents overlap.

use crate::config::{BUFFER_SIZE, DATA_OFF};
use crate::error::{Error, Result};
use crate::port::NvmPort;
use crate::store::header::SystemHeader;
use crate::store::index::{EntryFlags, IndexTable};
use crate::store::Store;

impl<P: NvmPort> Store<'_, P> {
    /// Compacts the data region. Idempotent: a second run finds nothing to
    /// move and only refreshes timestamps.
    pub fn defragment(&mut self) -> Result<()> {
        if let Err(err) = self.ensure_ready() {
            return Err(self.fail("defragment", 0, err));
        }
        if self.snapshot.is_some() {
            // a stream write session owns the media right now
            return Err(self.fail("defragment", 0, Error::InvalidState));
        }
        let live = self.index.live_count();
        if live == 0 {
            return self.reset_empty();
        }

        // checkpoint the management area as it is on media
        if let Err(err) = self.copy_management_to_backup() {
            return Err(self.fail("defragment", 0, err));
        }

        self.index.sort_live_by_addr();

        let mut write_pos = DATA_OFF;
        let mut moved_total: u32 = 0;
        for slot in 0..live {
            let entry = *self.index.entry(slot);
            let total = match self.read_block_header(entry.data_addr) {
                Ok(hdr) => hdr.total_size(),
                Err(err) => {
                    // data untouched so far or partially compacted; the
                    // checkpoint taken above remains the recovery point
                    self.reload_mirrors();
                    return Err(self.fail("defragment", entry.tag, err));
                }
            };
            if entry.data_addr != write_pos {
                if let Err(err) = self.move_block(entry.data_addr, write_pos, total) {
                    self.reload_mirrors();
                    return Err(self.fail("defragment", entry.tag, err));
                }
                self.index.entry_mut(slot).data_addr = write_pos;
            }
            self.index.entry_mut(slot).flags.remove(EntryFlags::DIRTY);
            write_pos += total;
            moved_total += total;
        }

        self.header.next_free_addr = write_pos;
        self.header.used_space = moved_total;
        self.header.free_space = self.header.data_region_size - moved_total;
        self.header.fragment_count = 0;
        self.header.fragment_size = 0;
        self.header.tag_count = live as u16;
        self.header.last_update_time = self.port.time_seconds();

        if let Err(err) = self.save_index() {
            self.reload_mirrors();
            return Err(self.fail("defragment", 0, err));
        }
        if let Err(err) = self.save_header() {
            return Err(self.fail("defragment", 0, err));
        }
        // refresh the checkpoint to the compacted layout, best effort
        if self.copy_management_to_backup().is_err() {
            warn!("backup refresh after defragmentation failed");
        }
        info!(
            "defragmented: {} live blocks, {} bytes in use",
            live, moved_total
        );
        Ok(())
    }

    /// Nothing live: reinitialize the management area outright. The commit
    /// counter survives, it is monotonic over the store's lifetime.
    fn reset_empty(&mut self) -> Result<()> {
        let total_writes = self.header.total_writes;
        let now = self.port.time_seconds();
        self.header = SystemHeader::fresh(self.magic, now);
        self.header.total_writes = total_writes;
        self.index = IndexTable::empty();
        if let Err(err) = self.save_index().and_then(|_| self.save_header()) {
            return Err(self.fail("defragment", 0, err));
        }
        if let Err(err) = self.copy_management_to_backup() {
            return Err(self.fail("defragment", 0, err));
        }
        info!("defragmented: store empty, management area reset");
        Ok(())
    }

    /// Chunked copy of one block towards the region start. `dst <= src`
    /// always holds, so a forward copy never reads clobbered bytes.
    fn move_block(&mut self, src: u32, dst: u32, total: u32) -> Result<()> {
        let mut remaining = total as usize;
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
        trace!("block moved {:#x} -> {:#x} ({} bytes)", src, dst, total);
        Ok(())
    }
}
