//! Randomized workload against an in-memory model of the store.

mod common;

use std::collections::HashMap;

use common::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tlv_fram::{Error, InitStatus};

const STEPS: usize = 400;

#[test]
fn randomized_workload_matches_model() {
    let (media, mut store) = fresh_store();
    let mut rng = StdRng::seed_from_u64(0x544C_5646);
    // (tag, cap) pairs; bulk is capped to keep the workload compact
    let tags: [(u16, usize); 5] = [
        (TAG_SYSTEM_CONFIG, 64),
        (TAG_CALIBRATION, 128),
        (TAG_LOG_CURSOR, 16),
        (TAG_BULK, 512),
        (TAG_SPARE, 32),
    ];
    let mut model: HashMap<u16, Vec<u8>> = HashMap::new();

    for step in 0..STEPS {
        let (tag, cap) = tags[rng.gen_range(0..tags.len())];
        match rng.gen_range(0..10u32) {
            0 => {
                let expect = model.remove(&tag).is_some();
                let result = store.delete(tag);
                assert_eq!(result.is_ok(), expect, "delete mismatch at step {}", step);
            }
            1 => {
                store.defragment().unwrap();
            }
            _ => {
                let len = rng.gen_range(1..=cap);
                let mut payload = vec![0u8; len];
                rng.fill(&mut payload[..]);
                match store.write(tag, &payload) {
                    Ok(()) => {
                        model.insert(tag, payload);
                    }
                    Err(Error::NoMemorySpace) => {
                        // reclaim fragments and retry once
                        store.defragment().unwrap();
                        store.write(tag, &payload).unwrap();
                        model.insert(tag, payload);
                    }
                    Err(err) => panic!("write failed at step {}: {}", step, err),
                }
            }
        }
        if step % 50 == 49 {
            assert_invariants(&mut store);
        }
    }

    let check = |store: &mut tlv_fram::Store<'_, tlv_fram::port::MemNvm>,
                 model: &HashMap<u16, Vec<u8>>| {
        for &(tag, _) in &tags {
            let mut buf = vec![0u8; 4096];
            match model.get(&tag) {
                Some(expected) => {
                    let n = store.read(tag, &mut buf).unwrap();
                    assert_eq!(&buf[..n], &expected[..], "payload mismatch for {:#06x}", tag);
                }
                None => {
                    assert!(!store.exists(tag));
                }
            }
        }
    };

    check(&mut store, &model);
    assert_invariants(&mut store);
    drop(store);

    // everything must hold across a reboot as well
    let (mut store, status) = remount(&media);
    assert_eq!(status, InitStatus::Ok);
    check(&mut store, &model);
    assert_invariants(&mut store);
}
