//! Lazy migration: on-read upgrades, write-back, refusal rules.

#![cfg(feature = "migration")]

mod common;

use common::{assert_invariants, TAG_SYSTEM_CONFIG};
use tlv_fram::config::DEVICE_SIZE;
use tlv_fram::port::MemNvm;
use tlv_fram::schema::SCHEMA_SENTINEL_TAG;
use tlv_fram::{Error, ErrorCode, SchemaEntry, SchemaTable, Store};

/// V1 layout (8 bytes): signature u32, language u8, timezone u8, flags u16.
/// V2 appends display settings to 24 bytes; V3 appends network settings to
/// 56 bytes. Shared fields stay bitwise identical.
fn migrate_config(buf: &mut [u8], len: &mut usize, old: u8, new: u8) -> tlv_fram::Result<()> {
    let mut version = old;
    while version < new {
        match version {
            1 => {
                if buf.len() < 24 {
                    return Err(Error::NoBufferMemory { required: 24 });
                }
                buf[8..24].fill(0);
                buf[8] = 100; // default brightness
                *len = 24;
            }
            2 => {
                if buf.len() < 56 {
                    return Err(Error::NoBufferMemory { required: 56 });
                }
                buf[24..56].fill(0);
                buf[24] = 1; // default network profile
                *len = 56;
            }
            _ => return Err(Error::Version),
        }
        version += 1;
    }
    Ok(())
}

fn failing_migrator(_buf: &mut [u8], _len: &mut usize, _old: u8, _new: u8) -> tlv_fram::Result<()> {
    Err(Error::Generic)
}

fn oversize_migrator(buf: &mut [u8], len: &mut usize, _old: u8, _new: u8) -> tlv_fram::Result<()> {
    *len = buf.len() + 1000;
    Ok(())
}

static SCHEMA_V1: [SchemaEntry; 2] = [
    SchemaEntry::new(TAG_SYSTEM_CONFIG, 64, 1, "system_config"),
    SchemaEntry::new(SCHEMA_SENTINEL_TAG, 0, 0, ""),
];

static SCHEMA_V3: [SchemaEntry; 2] = [
    SchemaEntry::new(TAG_SYSTEM_CONFIG, 64, 3, "system_config").with_migrate(migrate_config),
    SchemaEntry::new(SCHEMA_SENTINEL_TAG, 0, 0, ""),
];

static SCHEMA_V3_NO_MIGRATOR: [SchemaEntry; 2] = [
    SchemaEntry::new(TAG_SYSTEM_CONFIG, 64, 3, "system_config"),
    SchemaEntry::new(SCHEMA_SENTINEL_TAG, 0, 0, ""),
];

static SCHEMA_V3_FAILING: [SchemaEntry; 2] = [
    SchemaEntry::new(TAG_SYSTEM_CONFIG, 64, 3, "system_config").with_migrate(failing_migrator),
    SchemaEntry::new(SCHEMA_SENTINEL_TAG, 0, 0, ""),
];

static SCHEMA_V3_OVERSIZE: [SchemaEntry; 2] = [
    SchemaEntry::new(TAG_SYSTEM_CONFIG, 64, 3, "system_config").with_migrate(oversize_migrator),
    SchemaEntry::new(SCHEMA_SENTINEL_TAG, 0, 0, ""),
];

const V1_RECORD: [u8; 8] = [0x4C, 0x56, 0x54, 0x46, 2, 9, 0x34, 0x12];

/// Media carrying one V1 record for `TAG_SYSTEM_CONFIG`.
fn media_with_v1_record() -> MemNvm {
    let media = MemNvm::new(DEVICE_SIZE);
    let mut store = Store::new(media.clone(), SchemaTable::new(&SCHEMA_V1));
    store.init().unwrap();
    store.format(0).unwrap();
    store.write(TAG_SYSTEM_CONFIG, &V1_RECORD).unwrap();
    media
}

fn mount_with(media: &MemNvm, schema: &'static [SchemaEntry]) -> Store<'static, MemNvm> {
    let mut store = Store::new(media.clone(), SchemaTable::new(schema));
    store.init().unwrap();
    store
}

fn persisted_version(store: &mut Store<'_, MemNvm>, tag: u16) -> u8 {
    let mut version = 0;
    store
        .for_each(|info| {
            if info.tag == tag {
                version = info.version;
            }
        })
        .unwrap();
    version
}

#[cfg(all(feature = "lazy-migrate-read", not(feature = "auto-migrate-boot")))]
#[test]
fn read_upgrades_v1_to_v3_and_writes_back() {
    let media = media_with_v1_record();
    let mut store = mount_with(&media, &SCHEMA_V3);
    assert_eq!(persisted_version(&mut store, TAG_SYSTEM_CONFIG), 1);

    let mut buf = [0u8; 56];
    let n = store.read(TAG_SYSTEM_CONFIG, &mut buf).unwrap();
    assert_eq!(n, 56);
    // shared V1 fields preserved bitwise
    assert_eq!(&buf[..8], &V1_RECORD);
    // new fields at their documented defaults
    assert_eq!(buf[8], 100);
    assert_eq!(buf[24], 1);

    // the upgrade was persisted: version bumped, length grown
    assert_eq!(persisted_version(&mut store, TAG_SYSTEM_CONFIG), 3);
    assert_eq!(store.length(TAG_SYSTEM_CONFIG).unwrap(), 56);

    // a second read returns the stored V3 record unchanged
    let n = store.read(TAG_SYSTEM_CONFIG, &mut buf).unwrap();
    assert_eq!(n, 56);
    assert_eq!(&buf[..8], &V1_RECORD);
    assert_invariants(&mut store);
}

#[cfg(feature = "lazy-migrate-read")]
#[test]
fn upgraded_record_survives_remount() {
    let media = media_with_v1_record();
    let mut store = mount_with(&media, &SCHEMA_V3);
    let mut buf = [0u8; 56];
    store.read(TAG_SYSTEM_CONFIG, &mut buf).unwrap();
    drop(store);

    let mut store = mount_with(&media, &SCHEMA_V3);
    assert_eq!(persisted_version(&mut store, TAG_SYSTEM_CONFIG), 3);
    let n = store.read(TAG_SYSTEM_CONFIG, &mut buf).unwrap();
    assert_eq!(n, 56);
    assert_eq!(&buf[..8], &V1_RECORD);
}

#[cfg(all(feature = "lazy-migrate-read", not(feature = "auto-migrate-boot")))]
#[test]
fn short_buffers_learn_the_required_size() {
    let media = media_with_v1_record();
    let mut store = mount_with(&media, &SCHEMA_V3);

    // 8 bytes hold the V1 record but not the first upgrade step
    let mut tiny = [0u8; 8];
    assert_eq!(
        store.read(TAG_SYSTEM_CONFIG, &mut tiny),
        Err(Error::NoBufferMemory { required: 24 })
    );
    // 24 bytes clear step one, then stall on step two
    let mut mid = [0u8; 24];
    assert_eq!(
        store.read(TAG_SYSTEM_CONFIG, &mut mid),
        Err(Error::NoBufferMemory { required: 56 })
    );
    // 56 bytes complete the chain
    let mut full = [0u8; 56];
    assert_eq!(store.read(TAG_SYSTEM_CONFIG, &mut full).unwrap(), 56);
}

#[cfg(feature = "lazy-migrate-read")]
#[test]
fn downgrade_is_refused() {
    let media = MemNvm::new(DEVICE_SIZE);
    let mut store = Store::new(media.clone(), SchemaTable::new(&SCHEMA_V3));
    store.init().unwrap();
    store.format(0).unwrap();
    let mut v3 = [0u8; 56];
    v3[..8].copy_from_slice(&V1_RECORD);
    store.write(TAG_SYSTEM_CONFIG, &v3).unwrap();
    drop(store);

    // an older firmware (schema v1) must not reinterpret a v3 record
    let mut store = mount_with(&media, &SCHEMA_V1);
    let mut buf = [0u8; 64];
    assert_eq!(store.read(TAG_SYSTEM_CONFIG, &mut buf), Err(Error::Version));
    assert_eq!(store.last_error(), ErrorCode::Version);
}

#[cfg(feature = "lazy-migrate-read")]
#[test]
fn missing_migrator_is_refused() {
    let media = media_with_v1_record();
    let mut store = mount_with(&media, &SCHEMA_V3_NO_MIGRATOR);
    let mut buf = [0u8; 64];
    assert_eq!(store.read(TAG_SYSTEM_CONFIG, &mut buf), Err(Error::Version));
}

#[cfg(feature = "lazy-migrate-read")]
#[test]
fn failing_migrator_returns_original_data() {
    let media = media_with_v1_record();
    let mut store = mount_with(&media, &SCHEMA_V3_FAILING);
    let mut buf = [0u8; 64];
    // the read succeeds with the untouched V1 payload
    let n = store.read(TAG_SYSTEM_CONFIG, &mut buf).unwrap();
    assert_eq!(&buf[..n], &V1_RECORD);
    // and the failure is on the ledger
    assert_eq!(store.last_error(), ErrorCode::Generic);
    let detail = store.last_error_detail().unwrap();
    assert_eq!(detail.tag, TAG_SYSTEM_CONFIG);
    // the record stays at its old version
    assert_eq!(persisted_version(&mut store, TAG_SYSTEM_CONFIG), 1);
}

#[cfg(feature = "lazy-migrate-read")]
#[test]
fn oversize_migrator_output_returns_original_data() {
    let media = media_with_v1_record();
    let mut store = mount_with(&media, &SCHEMA_V3_OVERSIZE);
    let mut buf = [0u8; 64];
    let n = store.read(TAG_SYSTEM_CONFIG, &mut buf).unwrap();
    assert_eq!(&buf[..n], &V1_RECORD);
    assert_eq!(store.last_error(), ErrorCode::InvalidParam);
}

#[cfg(not(feature = "auto-migrate-boot"))]
#[test]
fn migrate_all_upgrades_every_stale_record() {
    let media = media_with_v1_record();
    let mut store = mount_with(&media, &SCHEMA_V3);

    assert_eq!(store.migrate_all().unwrap(), 1);
    assert_eq!(persisted_version(&mut store, TAG_SYSTEM_CONFIG), 3);
    assert_eq!(store.length(TAG_SYSTEM_CONFIG).unwrap(), 56);

    // idempotent: nothing left to upgrade
    assert_eq!(store.migrate_all().unwrap(), 0);
    assert_invariants(&mut store);
}
