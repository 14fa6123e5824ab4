//! Defragmentation: compaction, idempotence, accounting resets.

mod common;

use common::*;
use tlv_fram::config::DATA_OFF;
use tlv_fram::TagInfo;

#[test]
fn compaction_after_deleting_the_middle_block() {
    let (_media, mut store) = fresh_store();
    store.write(TAG_SYSTEM_CONFIG, &[0xAA; 16]).unwrap();
    store.write(TAG_CALIBRATION, &[0xBB; 32]).unwrap();
    store.write(TAG_LOG_CURSOR, &[0xCC; 16]).unwrap();
    store.delete(TAG_CALIBRATION).unwrap();
    assert_eq!(store.statistics().fragment_count, 1);

    store.defragment().unwrap();

    let stats = store.statistics();
    assert_eq!(stats.fragment_count, 0);
    assert_eq!(stats.fragment_size, 0);
    assert_eq!(stats.tag_count, 2);
    // two 16-byte blocks remain: (14+16+2) + (14+16+2)
    assert_eq!(stats.next_free_addr - DATA_OFF, 64);
    assert_eq!(stats.used_space, 64);

    let mut buf = [0u8; 64];
    assert_eq!(store.read(TAG_SYSTEM_CONFIG, &mut buf).unwrap(), 16);
    assert_eq!(&buf[..16], &[0xAA; 16]);
    assert_eq!(store.read(TAG_LOG_CURSOR, &mut buf).unwrap(), 16);
    assert_eq!(&buf[..16], &[0xCC; 16]);
    assert_invariants(&mut store);
}

#[test]
fn blocks_end_up_contiguous_in_address_order() {
    let (_media, mut store) = fresh_store();
    store.write(TAG_SYSTEM_CONFIG, &[1; 20]).unwrap();
    store.write(TAG_CALIBRATION, &[2; 40]).unwrap();
    store.write(TAG_LOG_CURSOR, &[3; 10]).unwrap();
    // grow the first tag so it relocates to the end
    store.write(TAG_SYSTEM_CONFIG, &[4; 60]).unwrap();
    assert_eq!(store.statistics().fragment_count, 1);

    store.defragment().unwrap();

    let mut infos: Vec<TagInfo> = Vec::new();
    store.for_each(|info| infos.push(*info)).unwrap();
    // sorted ascending by address and tightly packed from DATA_OFF
    let mut expect_addr = DATA_OFF;
    for info in &infos {
        assert_eq!(info.data_addr, expect_addr);
        expect_addr += (14 + info.length + 2) as u32;
    }
    assert_eq!(store.statistics().next_free_addr, expect_addr);
    assert_invariants(&mut store);
}

#[test]
fn defragment_is_idempotent() {
    let (_media, mut store) = fresh_store();
    store.write(TAG_SYSTEM_CONFIG, &[5; 24]).unwrap();
    store.write(TAG_CALIBRATION, &[6; 48]).unwrap();
    store.delete(TAG_SYSTEM_CONFIG).unwrap();

    store.defragment().unwrap();
    let first = store.statistics();
    store.defragment().unwrap();
    let second = store.statistics();

    assert_eq!(first.tag_count, second.tag_count);
    assert_eq!(first.used_space, second.used_space);
    assert_eq!(first.free_space, second.free_space);
    assert_eq!(first.fragment_count, second.fragment_count);
    assert_eq!(first.next_free_addr, second.next_free_addr);

    let mut buf = [0u8; 128];
    assert_eq!(store.read(TAG_CALIBRATION, &mut buf).unwrap(), 48);
    assert_eq!(&buf[..48], &[6; 48]);
}

#[test]
fn empty_store_defragment_resets_management() {
    let (_media, mut store) = fresh_store();
    store.write(TAG_SYSTEM_CONFIG, &[1; 8]).unwrap();
    store.write(TAG_CALIBRATION, &[2; 8]).unwrap();
    store.delete(TAG_SYSTEM_CONFIG).unwrap();
    store.delete(TAG_CALIBRATION).unwrap();
    let writes_before = store.statistics().total_writes;

    store.defragment().unwrap();

    let stats = store.statistics();
    assert_eq!(stats.tag_count, 0);
    assert_eq!(stats.used_space, 0);
    assert_eq!(stats.fragment_count, 0);
    assert_eq!(stats.next_free_addr, DATA_OFF);
    // the commit counter is monotonic across the reset
    assert_eq!(stats.total_writes, writes_before);
    assert!(!store.exists(TAG_SYSTEM_CONFIG));
}

#[test]
fn defragmented_state_survives_remount() {
    let (media, mut store) = fresh_store();
    store.write(TAG_SYSTEM_CONFIG, &[7; 30]).unwrap();
    store.write(TAG_CALIBRATION, &[8; 50]).unwrap();
    store.write(TAG_SYSTEM_CONFIG, &[9; 60]).unwrap(); // relocates
    store.defragment().unwrap();
    let before = store.statistics();
    drop(store);

    let (mut store, status) = remount(&media);
    assert_eq!(status, tlv_fram::InitStatus::Ok);
    let after = store.statistics();
    assert_eq!(after.used_space, before.used_space);
    assert_eq!(after.next_free_addr, before.next_free_addr);
    assert_eq!(after.fragment_count, 0);
    let mut buf = [0u8; 64];
    assert_eq!(store.read(TAG_SYSTEM_CONFIG, &mut buf).unwrap(), 60);
    assert_eq!(&buf[..60], &[9; 60]);
    assert_invariants(&mut store);
}
