//! Chunked read/write sessions for payloads larger than the scratch
//! buffer.
//!
//! Sessions live in a fixed pool. A handle packs the stream magic, the
//! slot's generation counter and the slot number into 32 bits, so a stale
//! handle kept across a release reliably fails the generation check and
//! comes back as `InvalidHandle`. A write session holds the allocator
//! snapshot from `write_begin` until `write_end` or `write_abort`; the
//! block becomes visible only when `write_end` saves the index.

use crate::config::{BLOCK_HEADER_SIZE, MAX_STREAM_HANDLES};
use crate::error::{Error, Result};
use crate::port::NvmPort;
use crate::schema::SCHEMA_SENTINEL_TAG;
use crate::store::block::BlockHeader;
use crate::store::index::EntryFlags;
use crate::store::{space, Placement, Store};
use crate::util::crc16::Crc16;

const STREAM_MAGIC: u16 = 0x5453;

/// Opaque stream session token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandle(u32);

impl StreamHandle {
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Reconstructs a handle, e.g. one carried over a host protocol. An
    /// arbitrary value is safe: it is validated on every use.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

fn make_handle(slot: usize, generation: u8) -> StreamHandle {
    StreamHandle((STREAM_MAGIC as u32) << 16 | (generation as u32) << 8 | slot as u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(super) enum SessionState {
    #[default]
    Idle,
    Writing,
    Reading,
}

/// One slot of the session pool.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct StreamSession {
    state: SessionState,
    generation: u8,
    tag: u16,
    version: u8,
    data_addr: u32,
    total_len: u32,
    processed: u32,
    crc: Crc16,
    /// Write sessions: placement for commit and abort accounting.
    slot: Option<usize>,
    in_place: bool,
    old_total: u32,
}

impl<P: NvmPort> Store<'_, P> {
    fn resolve_session(&self, handle: StreamHandle, expect: SessionState) -> Result<usize> {
        let raw = handle.raw();
        if (raw >> 16) as u16 != STREAM_MAGIC {
            return Err(Error::InvalidHandle);
        }
        let slot = (raw & 0xFF) as usize;
        let generation = (raw >> 8) as u8;
        if slot >= MAX_STREAM_HANDLES {
            return Err(Error::InvalidHandle);
        }
        let session = &self.sessions[slot];
        if session.generation != generation || session.state != expect {
            return Err(Error::InvalidHandle);
        }
        Ok(slot)
    }

    fn idle_session(&self) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| s.state == SessionState::Idle)
    }

    /// Returns the slot to the pool. The generation survives so that old
    /// handles to this slot stay dead.
    fn release_session(&mut self, slot: usize) {
        let generation = self.sessions[slot].generation;
        self.sessions[slot] = StreamSession {
            generation,
            ..Default::default()
        };
    }

    pub(super) fn active_sessions(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.state != SessionState::Idle)
            .count()
    }

    /// Opens a chunked write of `total_len` bytes for `tag`. Placement and
    /// accounting match [`Store::write`]; the 14-byte block header is
    /// written immediately.
    pub fn stream_write_begin(&mut self, tag: u16, total_len: usize) -> Result<StreamHandle> {
        if let Err(err) = self.check_writable(tag, total_len) {
            return Err(self.fail("stream_write_begin", tag, err));
        }
        let version = match self.schema.lookup(tag) {
            Some(entry) => entry.version,
            None => return Err(self.fail("stream_write_begin", tag, Error::NotFound)),
        };
        let slot = match self.idle_session() {
            Some(slot) => slot,
            None => return Err(self.fail("stream_write_begin", tag, Error::InvalidState)),
        };
        if let Err(err) = self.take_snapshot() {
            return Err(self.fail("stream_write_begin", tag, err));
        }
        let placement = match self.place_block(tag, total_len) {
            Ok(p) => p,
            Err(err) => {
                self.rollback_and_persist();
                return Err(self.fail("stream_write_begin", tag, err));
            }
        };
        let write_count = match self.read_block_header(placement.addr) {
            Ok(old) if old.tag == tag => old.write_count.wrapping_add(1),
            _ => 1,
        };
        let header = BlockHeader {
            tag,
            length: total_len as u16,
            version,
            flags: 0,
            timestamp: self.port.time_seconds(),
            write_count,
        };
        let raw = header.encode();
        if self.port.nvm_write(placement.addr, &raw).is_err() {
            self.rollback_and_persist();
            return Err(self.fail("stream_write_begin", tag, Error::Generic));
        }
        let mut crc = Crc16::new();
        crc.update(&raw);

        let session = &mut self.sessions[slot];
        session.generation = session.generation.wrapping_add(1);
        session.state = SessionState::Writing;
        session.tag = tag;
        session.version = version;
        session.data_addr = placement.addr;
        session.total_len = total_len as u32;
        session.processed = 0;
        session.crc = crc;
        session.slot = placement.slot;
        session.in_place = placement.in_place;
        session.old_total = placement.old_total;
        trace!(
            "stream write open: tag {:#06x}, {} bytes at {:#x}",
            tag,
            total_len,
            placement.addr
        );
        Ok(make_handle(slot, session.generation))
    }

    /// Appends `data` to an open write session.
    pub fn stream_write_chunk(&mut self, handle: StreamHandle, data: &[u8]) -> Result<()> {
        let slot = match self.resolve_session(handle, SessionState::Writing) {
            Ok(slot) => slot,
            Err(err) => return Err(self.fail("stream_write_chunk", 0, err)),
        };
        let session = self.sessions[slot];
        if session.processed as usize + data.len() > session.total_len as usize {
            return Err(self.fail("stream_write_chunk", session.tag, Error::InvalidParam));
        }
        let offset = session.data_addr + BLOCK_HEADER_SIZE as u32 + session.processed;
        if self.port.nvm_write(offset, data).is_err() {
            // the session stays open; the caller decides to retry or abort
            return Err(self.fail("stream_write_chunk", session.tag, Error::Generic));
        }
        let session = &mut self.sessions[slot];
        session.crc.update(data);
        session.processed += data.len() as u32;
        Ok(())
    }

    /// Seals the block and commits visibility. Requires the full payload
    /// to have been streamed.
    pub fn stream_write_end(&mut self, handle: StreamHandle) -> Result<()> {
        let slot = match self.resolve_session(handle, SessionState::Writing) {
            Ok(slot) => slot,
            Err(err) => return Err(self.fail("stream_write_end", 0, err)),
        };
        let session = self.sessions[slot];
        if session.processed != session.total_len {
            return Err(self.fail("stream_write_end", session.tag, Error::InvalidState));
        }
        let trailer_off = session.data_addr + BLOCK_HEADER_SIZE as u32 + session.total_len;
        let trailer = session.crc.finish().to_le_bytes();
        if self.port.nvm_write(trailer_off, &trailer).is_err() {
            return Err(self.fail("stream_write_end", session.tag, Error::Generic));
        }
        let placement = Placement {
            slot: session.slot,
            addr: session.data_addr,
            in_place: session.in_place,
            old_total: session.old_total,
        };
        if let Err(err) = self.commit_index(session.tag, session.version, &placement) {
            self.release_session(slot);
            return Err(self.fail("stream_write_end", session.tag, err));
        }
        if let Err(err) = self.commit_header() {
            self.release_session(slot);
            return Err(self.fail("stream_write_end", session.tag, err));
        }
        self.release_session(slot);
        trace!("stream write sealed: tag {:#06x}", session.tag);
        Ok(())
    }

    /// Abandons a write session and rolls the bookkeeping back.
    ///
    /// A fresh-allocation session leaves no trace: the rolled-back bump
    /// pointer reuses the extent. An in-place session has already
    /// overwritten the previous block, so its slot is invalidated and the
    /// destroyed extent accounted as a fragment.
    pub fn stream_write_abort(&mut self, handle: StreamHandle) -> Result<()> {
        let slot = match self.resolve_session(handle, SessionState::Writing) {
            Ok(slot) => slot,
            Err(err) => return Err(self.fail("stream_write_abort", 0, err)),
        };
        let session = self.sessions[slot];
        if let Some(snap) = self.snapshot.take() {
            snap.restore(&mut self.header);
        }
        if session.in_place {
            if let Some(index_slot) = session.slot {
                let entry = self.index.entry_mut(index_slot);
                entry.flags.remove(EntryFlags::VALID);
                entry.flags.insert(EntryFlags::DIRTY);
                self.header.tag_count = self.header.tag_count.saturating_sub(1);
                space::reduce_used(&mut self.header, session.old_total);
                space::add_fragment(&mut self.header, session.old_total);
                if let Err(err) = self.save_index() {
                    let _ = self.fail("stream_write_abort", session.tag, err);
                }
            }
        }
        if let Err(err) = self.save_header() {
            let _ = self.fail("stream_write_abort", session.tag, err);
        }
        self.release_session(slot);
        debug!("stream write aborted: tag {:#06x}", session.tag);
        Ok(())
    }

    /// Opens a chunked read of `tag`. Returns the handle and the stored
    /// payload length.
    pub fn stream_read_begin(&mut self, tag: u16) -> Result<(StreamHandle, usize)> {
        if let Err(err) = self.ensure_ready() {
            return Err(self.fail("stream_read_begin", tag, err));
        }
        if tag == 0 || tag == SCHEMA_SENTINEL_TAG {
            return Err(self.fail("stream_read_begin", tag, Error::InvalidParam));
        }
        if self.schema.lookup(tag).is_none() {
            return Err(self.fail("stream_read_begin", tag, Error::NotFound));
        }
        let pos = self.schema.position(tag);
        let index_slot = match self.index.find(tag, pos) {
            Some(slot) => slot,
            None => return Err(self.fail("stream_read_begin", tag, Error::NotFound)),
        };
        let slot = match self.idle_session() {
            Some(slot) => slot,
            None => return Err(self.fail("stream_read_begin", tag, Error::InvalidState)),
        };
        let addr = self.index.entry(index_slot).data_addr;
        let mut raw = [0u8; BLOCK_HEADER_SIZE];
        if self.port.nvm_read(addr, &mut raw).is_err() {
            return Err(self.fail("stream_read_begin", tag, Error::Generic));
        }
        let header = BlockHeader::parse(&raw);
        if header.tag != tag {
            return Err(self.fail("stream_read_begin", tag, Error::Corrupted));
        }
        let mut crc = Crc16::new();
        crc.update(&raw);

        let session = &mut self.sessions[slot];
        session.generation = session.generation.wrapping_add(1);
        session.state = SessionState::Reading;
        session.tag = tag;
        session.version = header.version;
        session.data_addr = addr;
        session.total_len = header.length as u32;
        session.processed = 0;
        session.crc = crc;
        session.slot = None;
        session.in_place = false;
        session.old_total = 0;
        Ok((make_handle(slot, session.generation), header.length as usize))
    }

    /// Reads the next chunk into `buf`; returns the number of bytes
    /// produced, 0 at end of payload.
    pub fn stream_read_chunk(&mut self, handle: StreamHandle, buf: &mut [u8]) -> Result<usize> {
        let slot = match self.resolve_session(handle, SessionState::Reading) {
            Ok(slot) => slot,
            Err(err) => return Err(self.fail("stream_read_chunk", 0, err)),
        };
        let session = self.sessions[slot];
        let remaining = (session.total_len - session.processed) as usize;
        let n = remaining.min(buf.len());
        if n == 0 {
            return Ok(0);
        }
        let offset = session.data_addr + BLOCK_HEADER_SIZE as u32 + session.processed;
        if self.port.nvm_read(offset, &mut buf[..n]).is_err() {
            return Err(self.fail("stream_read_chunk", session.tag, Error::Generic));
        }
        let session = &mut self.sessions[slot];
        session.crc.update(&buf[..n]);
        session.processed += n as u32;
        Ok(n)
    }

    /// Closes a read session, verifying the block CRC over everything
    /// streamed. Requires the full payload to have been consumed.
    pub fn stream_read_end(&mut self, handle: StreamHandle) -> Result<()> {
        let slot = match self.resolve_session(handle, SessionState::Reading) {
            Ok(slot) => slot,
            Err(err) => return Err(self.fail("stream_read_end", 0, err)),
        };
        let session = self.sessions[slot];
        if session.processed != session.total_len {
            return Err(self.fail("stream_read_end", session.tag, Error::InvalidState));
        }
        let trailer_off = session.data_addr + BLOCK_HEADER_SIZE as u32 + session.total_len;
        let mut trailer = [0u8; 2];
        if self.port.nvm_read(trailer_off, &mut trailer).is_err() {
            return Err(self.fail("stream_read_end", session.tag, Error::Generic));
        }
        self.release_session(slot);
        if session.crc.finish() != u16::from_le_bytes(trailer) {
            return Err(self.fail("stream_read_end", session.tag, Error::CrcFailed));
        }
        Ok(())
    }

    /// Abandons a read session.
    pub fn stream_read_abort(&mut self, handle: StreamHandle) -> Result<()> {
        let slot = match self.resolve_session(handle, SessionState::Reading) {
            Ok(slot) => slot,
            Err(err) => return Err(self.fail("stream_read_abort", 0, err)),
        };
        self.release_session(slot);
        Ok(())
    }
}

// Handles address at most 256 pool slots.
const_assert!(MAX_STREAM_HANDLES <= 256);
