#![cfg_attr(not(test), no_std)]

//! Durable tag-addressed key/value store for small byte-addressable NVM
//! devices (FRAM-class: no erase blocks, effectively unlimited endurance).
//!
//! The store maps 16-bit application tags to variable-length values. Each
//! tag is bound to a [`schema::SchemaEntry`] describing its maximum length,
//! current structural version and optional in-place migrator. All persisted
//! structures are CRC-16 protected; mutating operations commit through a
//! single index save so that a failure leaves the previous state readable.

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

pub mod config;
mod error;
pub mod global;
pub mod port;
pub mod schema;
mod store;
mod util;

pub use error::{error_string, Error, ErrorCode, ErrorRecord, Result};
pub use port::{NvmError, NvmPort};
pub use schema::{MigrateFn, SchemaEntry, SchemaTable};
pub use store::{
    BatchRead, BatchWrite, InitStatus, Statistics, Store, StoreState, StreamHandle, TagInfo,
};
pub use util::crc16::{crc16, Crc16};

/// Version of this crate, for host-side diagnostics.
pub fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
