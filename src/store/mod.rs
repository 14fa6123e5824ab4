//! The persistence engine: context, core KV operations, maintenance.
//!
//! One [`Store`] owns the port, the schema view, the in-RAM mirrors of the
//! management area and the stream session pool. Mutating operations follow
//! a fixed protocol: capture the allocator snapshot, write block bytes,
//! commit visibility through the index save, then persist the header. Any
//! failure before the index save rolls the bookkeeping back wholesale.

mod backup;
mod block;
mod defrag;
mod header;
mod index;
#[cfg(feature = "migration")]
mod migrate;
mod space;
mod stream;

use alloc::vec::Vec;

use derive_more::Display;

use crate::config::{
    block_total_size, BUFFER_SIZE, HEADER_OFF, INDEX_OFF, INDEX_TABLE_SIZE, MAX_STREAM_HANDLES,
    SYSTEM_HEADER_SIZE, SYSTEM_MAGIC,
};
use crate::error::{Error, ErrorCode, ErrorLedger, ErrorRecord, Result};
use crate::port::NvmPort;
use crate::schema::{SchemaTable, SCHEMA_SENTINEL_TAG};
use crate::store::space::{Snapshot, ALLOC_FAILED};
use crate::store::header::SystemHeader;
use crate::store::index::IndexTable;
use crate::store::stream::StreamSession;

pub use crate::store::stream::StreamHandle;

/// Engine lifecycle state.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// Port not brought up yet; only `init` is allowed.
    #[display(fmt = "uninitialized")]
    Uninitialized,
    /// Media holds no recognizable store; only `format` is allowed.
    #[display(fmt = "unformatted")]
    Unformatted,
    /// Mounted and serving requests.
    #[display(fmt = "ready")]
    Ready,
}

/// What `init` found on the media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    /// No store present; `format` is required before use.
    FirstBoot,
    /// Mounted cleanly.
    Ok,
    /// Primary management area was corrupt; mounted from the backup.
    Recovered,
}

/// Aggregate counters, mirrored from the system header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    pub tag_count: u16,
    pub total_writes: u32,
    pub last_update_time: u32,
    pub data_region_size: u32,
    pub free_space: u32,
    pub used_space: u32,
    pub fragment_count: u32,
    pub fragment_size: u32,
    pub next_free_addr: u32,
    pub stream_sessions_active: usize,
    pub errors_recorded: u32,
}

/// Per-tag summary handed to [`Store::for_each`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagInfo {
    pub tag: u16,
    pub version: u8,
    pub length: usize,
    pub write_count: u32,
    pub timestamp: u32,
    pub data_addr: u32,
}

/// One element of a [`Store::write_batch`] request.
pub struct BatchWrite<'a> {
    pub tag: u16,
    pub data: &'a [u8],
}

/// One element of a [`Store::read_batch`] request. `len` reports the bytes
/// read for elements that succeeded, 0 otherwise.
pub struct BatchRead<'a> {
    pub tag: u16,
    pub buf: &'a mut [u8],
    pub len: usize,
}

/// Placement decision for a block about to be written.
struct Placement {
    /// Existing slot being superseded, if any.
    slot: Option<usize>,
    addr: u32,
    /// The write targets the superseded block's own extent.
    in_place: bool,
    /// On-media size of the superseded block.
    old_total: u32,
}

/// The tag-addressed store over one NVM device.
pub struct Store<'s, P: NvmPort> {
    port: P,
    schema: SchemaTable<'s>,
    magic: u32,
    state: StoreState,
    header: SystemHeader,
    index: IndexTable,
    snapshot: Option<Snapshot>,
    scratch: Vec<u8>,
    sessions: [StreamSession; MAX_STREAM_HANDLES],
    ledger: ErrorLedger,
}

impl<'s, P: NvmPort> Store<'s, P> {
    /// Binds a port and schema. Nothing touches the media until `init`.
    pub fn new(port: P, schema: SchemaTable<'s>) -> Self {
        Self {
            port,
            schema,
            magic: SYSTEM_MAGIC,
            state: StoreState::Uninitialized,
            header: SystemHeader::fresh(SYSTEM_MAGIC, 0),
            index: IndexTable::empty(),
            snapshot: None,
            scratch: vec![0u8; BUFFER_SIZE],
            sessions: Default::default(),
            ledger: ErrorLedger::new(),
        }
    }

    /* lifecycle */

    /// Brings up the port and mounts the store.
    ///
    /// A corrupt primary management area is transparently restored from the
    /// backup region (`Recovered`); unrecognizable media reports
    /// `FirstBoot` and waits for [`Store::format`]. An incompatible format
    /// version is an error; it is never silently reformatted.
    pub fn init(&mut self) -> Result<InitStatus> {
        if self.port.nvm_init().is_err() {
            return Err(self.fail("init", 0, Error::Generic));
        }
        self.snapshot = None;
        self.sessions = Default::default();
        let status = match self.mount() {
            Ok(status) => status,
            Err(err) => return Err(self.fail("init", 0, err)),
        };
        match status {
            InitStatus::FirstBoot => {
                self.state = StoreState::Unformatted;
                info!("no store on media, format required");
            }
            InitStatus::Ok => {
                self.state = StoreState::Ready;
                info!(
                    "mounted: {} tags, {} writes, {}/{} bytes used",
                    self.header.tag_count,
                    self.header.total_writes,
                    self.header.used_space,
                    self.header.data_region_size
                );
            }
            InitStatus::Recovered => {
                self.state = StoreState::Ready;
                warn!("primary management area corrupt, mounted from backup");
            }
        }
        #[cfg(feature = "auto-migrate-boot")]
        if self.state == StoreState::Ready {
            let migrated = self.migrate_all();
            if let Ok(n) = migrated {
                if n > 0 {
                    info!("boot migration upgraded {} tags", n);
                }
            }
        }
        Ok(status)
    }

    fn mount(&mut self) -> Result<InitStatus> {
        match self.load_header() {
            Ok(hdr) => {
                if hdr.verify_geometry().is_err() {
                    return self.try_restore().map(|_| InitStatus::Recovered);
                }
                self.header = hdr;
                match self.load_index() {
                    Ok(idx) => {
                        self.index = idx;
                        self.repair_tag_count();
                        Ok(InitStatus::Ok)
                    }
                    Err(_) => self.try_restore().map(|_| InitStatus::Recovered),
                }
            }
            // A newer or older format major is not recoverable from backup:
            // the backup carries the same format.
            Err(Error::Version) => Err(Error::Version),
            Err(_) => match self.try_restore() {
                Ok(()) => Ok(InitStatus::Recovered),
                Err(_) => Ok(InitStatus::FirstBoot),
            },
        }
    }

    /// The persisted `tag_count` must equal the live slot population; an
    /// index restored from an older backup can disagree.
    fn repair_tag_count(&mut self) {
        let live = self.index.live_count() as u16;
        if self.header.tag_count != live {
            warn!(
                "tag_count {} disagrees with index ({} live), repairing",
                self.header.tag_count, live
            );
            self.header.tag_count = live;
        }
    }

    /// Flushes and tears the context down; mirrors are reset.
    pub fn deinit(&mut self) {
        if self.state == StoreState::Ready {
            let _ = self.flush();
        }
        self.state = StoreState::Uninitialized;
        self.header = SystemHeader::fresh(self.magic, 0);
        self.index = IndexTable::empty();
        self.snapshot = None;
        self.sessions = Default::default();
    }

    /// Writes a fresh header, empty index and backup. `magic == 0` selects
    /// the default system magic.
    pub fn format(&mut self, magic: u32) -> Result<()> {
        if self.state == StoreState::Uninitialized {
            return Err(self.fail("format", 0, Error::InvalidState));
        }
        if magic != 0 {
            self.magic = magic;
        }
        let now = self.port.time_seconds();
        self.header = SystemHeader::fresh(self.magic, now);
        self.index = IndexTable::empty();
        self.snapshot = None;
        self.sessions = Default::default();
        if let Err(err) = self.save_index().and_then(|_| self.save_header()) {
            return Err(self.fail("format", 0, err));
        }
        if let Err(err) = self.copy_management_to_backup() {
            return Err(self.fail("format", 0, err));
        }
        self.state = StoreState::Ready;
        info!("formatted, magic {:#010x}", self.magic);
        Ok(())
    }

    pub fn state(&self) -> StoreState {
        self.state
    }

    /* core data path */

    /// Stores `data` under `tag`, atomically superseding any previous
    /// value. The new bytes become visible at the index save; any earlier
    /// failure leaves the previous value readable and the bookkeeping
    /// rolled back.
    pub fn write(&mut self, tag: u16, data: &[u8]) -> Result<()> {
        if let Err(err) = self.check_writable(tag, data.len()) {
            return Err(self.fail("write", tag, err));
        }
        let version = match self.schema.lookup(tag) {
            Some(entry) => entry.version,
            None => return Err(self.fail("write", tag, Error::NotFound)),
        };
        if let Err(err) = self.take_snapshot() {
            return Err(self.fail("write", tag, err));
        }
        let placement = match self.place_block(tag, data.len()) {
            Ok(p) => p,
            Err(err) => {
                self.rollback_and_persist();
                return Err(self.fail("write", tag, err));
            }
        };
        if let Err(err) = self.write_block(tag, version, data, placement.addr) {
            self.rollback_and_persist();
            return Err(self.fail("write", tag, err));
        }
        if let Err(err) = self.commit_index(tag, version, &placement) {
            return Err(self.fail("write", tag, err));
        }
        if let Err(err) = self.commit_header() {
            return Err(self.fail("write", tag, err));
        }
        self.maybe_auto_defrag();
        Ok(())
    }

    /// Reads the value stored under `tag` into `buf`, returning its
    /// length. With lazy migration enabled, an outdated record is upgraded
    /// in `buf` and written back before returning.
    pub fn read(&mut self, tag: u16, buf: &mut [u8]) -> Result<usize> {
        if let Err(err) = self.ensure_ready() {
            return Err(self.fail("read", tag, err));
        }
        if tag == 0 || tag == SCHEMA_SENTINEL_TAG || buf.is_empty() {
            return Err(self.fail("read", tag, Error::InvalidParam));
        }
        let schema_entry = match self.schema.lookup(tag) {
            Some(entry) => *entry,
            None => return Err(self.fail("read", tag, Error::NotFound)),
        };
        let pos = self.schema.position(tag);
        let slot = match self.index.find(tag, pos) {
            Some(slot) => slot,
            None => return Err(self.fail("read", tag, Error::NotFound)),
        };
        let entry = *self.index.entry(slot);
        let n = match self.read_block(entry.data_addr, buf) {
            Ok(n) => n,
            Err(err) => return Err(self.fail("read", tag, err)),
        };
        #[cfg(feature = "lazy-migrate-read")]
        if entry.version != schema_entry.version {
            return self.migrate_on_read(tag, entry.version, &schema_entry, entry.data_addr, buf, n);
        }
        #[cfg(not(feature = "lazy-migrate-read"))]
        let _ = schema_entry;
        Ok(n)
    }

    /// Removes `tag`. The block's extent is accounted as a fragment until
    /// the next defragmentation.
    pub fn delete(&mut self, tag: u16) -> Result<()> {
        if let Err(err) = self.ensure_ready() {
            return Err(self.fail("delete", tag, err));
        }
        if tag == 0 || tag == SCHEMA_SENTINEL_TAG {
            return Err(self.fail("delete", tag, Error::InvalidParam));
        }
        let pos = self.schema.position(tag);
        let slot = match self.index.find(tag, pos) {
            Some(slot) => slot,
            None => return Err(self.fail("delete", tag, Error::NotFound)),
        };
        if let Err(err) = self.take_snapshot() {
            return Err(self.fail("delete", tag, err));
        }
        let addr = self.index.entry(slot).data_addr;
        let total = match self.read_block_header(addr) {
            Ok(hdr) => hdr.total_size(),
            Err(err) => {
                self.rollback_and_persist();
                return Err(self.fail("delete", tag, err));
            }
        };
        space::reduce_used(&mut self.header, total);
        space::add_fragment(&mut self.header, total);
        self.index.remove(slot);
        self.header.tag_count = self.header.tag_count.saturating_sub(1);
        if let Err(err) = self.save_index() {
            self.reload_mirrors();
            self.snapshot = None;
            return Err(self.fail("delete", tag, err));
        }
        self.snapshot = None;
        self.header.last_update_time = self.port.time_seconds();
        if let Err(err) = self.save_header() {
            return Err(self.fail("delete", tag, err));
        }
        Ok(())
    }

    /// Persists both mirrors.
    pub fn flush(&mut self) -> Result<()> {
        if let Err(err) = self.ensure_ready() {
            return Err(self.fail("flush", 0, err));
        }
        if let Err(err) = self.save_index().and_then(|_| self.save_header()) {
            return Err(self.fail("flush", 0, err));
        }
        Ok(())
    }

    /// Whether a live value exists for `tag`.
    pub fn exists(&mut self, tag: u16) -> bool {
        if self.state != StoreState::Ready {
            return false;
        }
        let pos = self.schema.position(tag);
        self.index.find(tag, pos).is_some()
    }

    /// Length of the stored value, from the block header alone.
    pub fn length(&mut self, tag: u16) -> Result<usize> {
        if let Err(err) = self.ensure_ready() {
            return Err(self.fail("length", tag, err));
        }
        let pos = self.schema.position(tag);
        let slot = match self.index.find(tag, pos) {
            Some(slot) => slot,
            None => return Err(self.fail("length", tag, Error::NotFound)),
        };
        let addr = self.index.entry(slot).data_addr;
        match self.read_block_header(addr) {
            Ok(hdr) => Ok(hdr.length as usize),
            Err(err) => Err(self.fail("length", tag, err)),
        }
    }

    /* batch */

    /// Writes each element in order; returns the number that succeeded.
    /// There is no cross-element atomicity.
    pub fn write_batch(&mut self, items: &[BatchWrite<'_>]) -> usize {
        items
            .iter()
            .filter(|item| self.write(item.tag, item.data).is_ok())
            .count()
    }

    /// Reads each element in order; returns the number that succeeded.
    pub fn read_batch(&mut self, items: &mut [BatchRead<'_>]) -> usize {
        let mut succeeded = 0;
        for item in items.iter_mut() {
            match self.read(item.tag, item.buf) {
                Ok(n) => {
                    item.len = n;
                    succeeded += 1;
                }
                Err(_) => item.len = 0,
            }
        }
        succeeded
    }

    /* space and query */

    pub fn free_space(&self) -> u32 {
        self.header.free_space
    }

    pub fn used_space(&self) -> u32 {
        self.header.used_space
    }

    /// Dead share of the consumed data region, in percent.
    pub fn fragmentation_percent(&self) -> u32 {
        let consumed = self
            .header
            .next_free_addr
            .saturating_sub(self.header.data_region_start);
        if consumed == 0 {
            0
        } else {
            self.header.fragment_size.saturating_mul(100) / consumed
        }
    }

    pub fn statistics(&self) -> Statistics {
        Statistics {
            tag_count: self.header.tag_count,
            total_writes: self.header.total_writes,
            last_update_time: self.header.last_update_time,
            data_region_size: self.header.data_region_size,
            free_space: self.header.free_space,
            used_space: self.header.used_space,
            fragment_count: self.header.fragment_count,
            fragment_size: self.header.fragment_size,
            next_free_addr: self.header.next_free_addr,
            stream_sessions_active: self.active_sessions(),
            errors_recorded: self.ledger.recorded(),
        }
    }

    /// Calls `f` once per live tag with its block metadata.
    pub fn for_each<F: FnMut(&TagInfo)>(&mut self, mut f: F) -> Result<()> {
        if let Err(err) = self.ensure_ready() {
            return Err(self.fail("for_each", 0, err));
        }
        let slots: Vec<usize> = self.index.live_slots().collect();
        for slot in slots {
            let entry = *self.index.entry(slot);
            let hdr = match self.read_block_header(entry.data_addr) {
                Ok(hdr) => hdr,
                Err(err) => return Err(self.fail("for_each", entry.tag, err)),
            };
            f(&TagInfo {
                tag: entry.tag,
                version: entry.version,
                length: hdr.length as usize,
                write_count: hdr.write_count,
                timestamp: hdr.timestamp,
                data_addr: entry.data_addr,
            });
        }
        Ok(())
    }

    /// CRC-checks every live block; returns how many are corrupt. Each
    /// corrupt block is recorded in the error ledger.
    pub fn verify_all(&mut self) -> Result<usize> {
        if let Err(err) = self.ensure_ready() {
            return Err(self.fail("verify_all", 0, err));
        }
        let slots: Vec<usize> = self.index.live_slots().collect();
        let mut corrupted = 0;
        for slot in slots {
            let entry = *self.index.entry(slot);
            match self.verify_block(entry.data_addr, entry.tag) {
                Ok(()) => {}
                Err(Error::CrcFailed) => {
                    corrupted += 1;
                    let _ = self.fail("verify_all", entry.tag, Error::CrcFailed);
                }
                Err(Error::Corrupted) => {
                    corrupted += 1;
                    let _ = self.fail("verify_all", entry.tag, Error::Corrupted);
                }
                Err(err) => return Err(self.fail("verify_all", entry.tag, err)),
            }
        }
        Ok(corrupted)
    }

    /* error ledger */

    /// Code of the most recent failure, `Ok` if none since the last clear.
    pub fn last_error(&self) -> ErrorCode {
        self.ledger
            .last()
            .map(|rec| rec.code)
            .unwrap_or(ErrorCode::Ok)
    }

    /// Full record of the most recent failure.
    pub fn last_error_detail(&self) -> Option<ErrorRecord> {
        self.ledger.last()
    }

    pub fn clear_error(&mut self) {
        self.ledger.clear();
    }

    /// Retained failure records, oldest first.
    pub fn error_history(&self) -> impl Iterator<Item = ErrorRecord> + '_ {
        self.ledger.history()
    }

    /* internals */

    fn ensure_ready(&self) -> Result<()> {
        if self.state == StoreState::Ready {
            Ok(())
        } else {
            Err(Error::InvalidState)
        }
    }

    fn check_writable(&self, tag: u16, len: usize) -> Result<()> {
        self.ensure_ready()?;
        if tag == 0 || tag == SCHEMA_SENTINEL_TAG || len == 0 {
            return Err(Error::InvalidParam);
        }
        if let Some(entry) = self.schema.lookup(tag) {
            if len > entry.max_length as usize {
                return Err(Error::InvalidParam);
            }
        }
        Ok(())
    }

    fn fail(&mut self, op: &'static str, tag: u16, err: Error) -> Error {
        self.ledger.record(ErrorRecord {
            code: err.code(),
            tag,
            seconds: self.port.time_seconds(),
            millis: self.port.time_millis(),
            op,
        });
        warn!("{} failed for tag {:#06x}: {}", op, tag, err);
        err
    }

    /// Captures the one-per-operation snapshot. A second capture means a
    /// mutating operation (typically an open stream write) is in flight.
    fn take_snapshot(&mut self) -> Result<()> {
        if self.snapshot.is_some() {
            return Err(Error::InvalidState);
        }
        self.snapshot = Some(Snapshot::capture(&self.header));
        Ok(())
    }

    /// Restores the bookkeeping scalars and persists the rolled-back
    /// header, so that media and mirror agree on the pre-operation state.
    fn rollback_and_persist(&mut self) {
        if let Some(snap) = self.snapshot.take() {
            snap.restore(&mut self.header);
            if self.save_header().is_err() {
                warn!("failed to persist rolled-back header");
            }
        }
    }

    /// Decides where the next block for `tag` lands and books the space.
    /// All scalar effects are undone by a snapshot rollback.
    fn place_block(&mut self, tag: u16, payload_len: usize) -> Result<Placement> {
        let new_total = block_total_size(payload_len) as u32;
        let pos = self.schema.position(tag);
        if let Some(slot) = self.index.find(tag, pos) {
            let addr = self.index.entry(slot).data_addr;
            let old_total = self.read_block_header(addr)?.total_size();
            if new_total <= old_total {
                space::reduce_used(&mut self.header, old_total);
                space::increase_used(&mut self.header, new_total);
                return Ok(Placement {
                    slot: Some(slot),
                    addr,
                    in_place: true,
                    old_total,
                });
            }
            let new_addr = space::allocate(&mut self.header, new_total);
            if new_addr == ALLOC_FAILED {
                return Err(Error::NoMemorySpace);
            }
            // the superseded block becomes a fragment
            space::reduce_used(&mut self.header, old_total);
            space::add_fragment(&mut self.header, old_total);
            space::increase_used(&mut self.header, new_total);
            return Ok(Placement {
                slot: Some(slot),
                addr: new_addr,
                in_place: false,
                old_total,
            });
        }
        if self.index.find_free_slot().is_none() {
            return Err(Error::NoIndexSpace);
        }
        let addr = space::allocate(&mut self.header, new_total);
        if addr == ALLOC_FAILED {
            return Err(Error::NoMemorySpace);
        }
        space::increase_used(&mut self.header, new_total);
        Ok(Placement {
            slot: None,
            addr,
            in_place: false,
            old_total: 0,
        })
    }

    /// The visibility commit: updates the in-RAM index and saves it. On a
    /// save failure the rollback window has closed, so the mirrors are
    /// reloaded from media, which still holds the previous index.
    fn commit_index(&mut self, tag: u16, version: u8, placement: &Placement) -> Result<()> {
        match placement.slot {
            Some(slot) => self.index.update(slot, placement.addr, version),
            None => {
                self.index.add(tag, placement.addr, version)?;
                self.header.tag_count += 1;
            }
        }
        if let Err(err) = self.save_index() {
            self.reload_mirrors();
            self.snapshot = None;
            return Err(err);
        }
        Ok(())
    }

    /// Closes the operation: drops the snapshot, bumps the counters and
    /// persists the header.
    fn commit_header(&mut self) -> Result<()> {
        self.snapshot = None;
        self.header.total_writes += 1;
        self.header.last_update_time = self.port.time_seconds();
        self.save_header()
    }

    /* media access for the management area */

    fn load_header(&mut self) -> Result<SystemHeader> {
        let mut raw = [0u8; SYSTEM_HEADER_SIZE];
        self.port
            .nvm_read(HEADER_OFF, &mut raw)
            .map_err(|_| Error::Generic)?;
        SystemHeader::parse(&raw, self.magic)
    }

    fn save_header(&mut self) -> Result<()> {
        let raw = self.header.encode();
        self.port
            .nvm_write(HEADER_OFF, &raw)
            .map_err(|_| Error::Generic)
    }

    fn load_index(&mut self) -> Result<IndexTable> {
        let mut raw = vec![0u8; INDEX_TABLE_SIZE];
        self.port
            .nvm_read(INDEX_OFF, &mut raw)
            .map_err(|_| Error::Generic)?;
        IndexTable::parse(&raw)
    }

    fn save_index(&mut self) -> Result<()> {
        let raw = self.index.encode();
        self.port
            .nvm_write(INDEX_OFF, &raw)
            .map_err(|_| Error::Generic)
    }

    /// Re-reads both mirrors after a failed visibility commit; media is
    /// authoritative at that point.
    fn reload_mirrors(&mut self) {
        if let Ok(hdr) = self.load_header() {
            self.header = hdr;
        }
        if let Ok(idx) = self.load_index() {
            self.index = idx;
        } else {
            self.index.invalidate_hints();
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "auto-defrag")] {
        impl<P: NvmPort> Store<'_, P> {
            /// Tail-of-write hook: compact once the dead share of the
            /// consumed region passes the configured threshold.
            fn maybe_auto_defrag(&mut self) {
                use crate::config::AUTO_DEFRAG_THRESHOLD_PERCENT;
                let percent = self.fragmentation_percent();
                if percent >= AUTO_DEFRAG_THRESHOLD_PERCENT {
                    debug!("fragmentation {}% over threshold, compacting", percent);
                    if let Err(err) = self.defragment() {
                        warn!("auto defragmentation failed: {}", err);
                    }
                }
            }
        }
    } else {
        impl<P: NvmPort> Store<'_, P> {
            fn maybe_auto_defrag(&mut self) {}
        }
    }
}
