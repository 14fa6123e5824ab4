//! Shared fixture: a RAM-backed device and the test schema.

#![allow(dead_code)]

use tlv_fram::config::DEVICE_SIZE;
use tlv_fram::port::MemNvm;
use tlv_fram::schema::SCHEMA_SENTINEL_TAG;
use tlv_fram::{InitStatus, SchemaEntry, SchemaTable, Store};

pub const TAG_SYSTEM_CONFIG: u16 = 0x1001;
pub const TAG_CALIBRATION: u16 = 0x1002;
pub const TAG_LOG_CURSOR: u16 = 0x1003;
pub const TAG_BULK: u16 = 0x2001;
/// In the schema, never written by default.
pub const TAG_SPARE: u16 = 0x2002;

pub static SCHEMA: [SchemaEntry; 6] = [
    SchemaEntry::new(TAG_SYSTEM_CONFIG, 64, 1, "system_config"),
    SchemaEntry::new(TAG_CALIBRATION, 128, 1, "calibration"),
    SchemaEntry::new(TAG_LOG_CURSOR, 16, 1, "log_cursor"),
    SchemaEntry::new(TAG_BULK, 4096, 1, "bulk_blob"),
    SchemaEntry::new(TAG_SPARE, 32, 1, "spare"),
    SchemaEntry::new(SCHEMA_SENTINEL_TAG, 0, 0, ""),
];

/// Blank media, formatted store.
pub fn fresh_store() -> (MemNvm, Store<'static, MemNvm>) {
    let media = MemNvm::new(DEVICE_SIZE);
    let mut store = Store::new(media.clone(), SchemaTable::new(&SCHEMA));
    assert_eq!(store.init().unwrap(), InitStatus::FirstBoot);
    store.format(0).unwrap();
    (media, store)
}

/// Mounts a second store over the same media, simulating a reboot.
pub fn remount(media: &MemNvm) -> (Store<'static, MemNvm>, InitStatus) {
    let mut store = Store::new(media.clone(), SchemaTable::new(&SCHEMA));
    let status = store.init().expect("remount failed");
    (store, status)
}

/// Synthetic schema of `n` tags starting at 0x4000, for capacity tests.
pub fn wide_schema(n: u16, max_length: u16) -> Vec<SchemaEntry> {
    (0..n)
        .map(|i| SchemaEntry::new(0x4000 + i, max_length, 1, "capacity_probe"))
        .collect()
}

/// Universal invariants that must hold after any public operation.
pub fn assert_invariants(store: &mut Store<'_, MemNvm>) {
    let stats = store.statistics();
    assert_eq!(
        stats.used_space + stats.free_space,
        stats.data_region_size,
        "used + free must equal the data region size"
    );
    let consumed = stats.next_free_addr - tlv_fram::config::DATA_OFF;
    assert!(
        stats.fragment_size + stats.used_space <= consumed || consumed == 0,
        "fragments + live bytes cannot exceed the consumed region"
    );
    assert_eq!(store.verify_all().unwrap(), 0, "all live blocks must verify");
}
