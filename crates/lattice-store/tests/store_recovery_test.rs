//! End-to-end tests for store recovery and composition: chained payloads,
//! id recycling across simulated crashes, and the last-closed watermark.

use lattice_store::store::{MetaPosition, StoreConfig};
use lattice_store::{DynamicRecordStore, LoadMode, MetadataStore};
use std::time::Duration;
use tempfile::TempDir;

fn config() -> StoreConfig {
    // RUST_LOG=lattice_store=debug surfaces store lifecycle logs in tests.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    StoreConfig {
        page_size: 1024,
        ..StoreConfig::default()
    }
}

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(seed)).collect()
}

#[test]
fn test_chains_survive_crash_and_ids_are_rebuilt() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("values.store");

    let (kept_start, deleted_ids, kept_bytes) = {
        let store = DynamicRecordStore::open(&path, 128, &config()).unwrap();

        // The doomed chain sits below the kept one so its blocks become
        // free-list holes rather than tail space.
        let doomed = store.store_payload(&payload(700, 5), Vec::new()).unwrap();
        let kept_bytes = payload(1000, 3);
        let kept = store.store_payload(&kept_bytes, Vec::new()).unwrap();
        let deleted_ids = store.delete_chain(doomed.start_id()).unwrap();

        store.flush().unwrap();
        (kept.start_id(), deleted_ids, kept_bytes)
        // Dropped without close: the next open must not trust the id file.
    };

    let store = DynamicRecordStore::open(&path, 128, &config()).unwrap();

    // The surviving chain reads back byte for byte.
    let records = store
        .get_records(kept_start, LoadMode::Normal, true)
        .unwrap();
    assert_eq!(store.read_full_byte_array(&records).unwrap(), kept_bytes);

    // Every deleted block id was rediscovered as free and is handed out
    // again before the high id grows.
    let high_id = store.store().high_id();
    let mut recycled: Vec<u64> = (0..deleted_ids.len())
        .map(|_| store.store().next_id().unwrap())
        .collect();
    recycled.sort_unstable();
    let mut expected = deleted_ids.clone();
    expected.sort_unstable();
    assert_eq!(recycled, expected);
    assert_eq!(store.store().next_id().unwrap(), high_id);
}

#[test]
fn test_overwrite_in_place_recycles_blocks() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("values.store");
    let store = DynamicRecordStore::open(&path, 64, &config()).unwrap();

    let first = store.store_payload(&payload(400, 7), Vec::new()).unwrap();
    let first_len = first.records.len();

    // Shrink, then grow the same logical value, reusing its blocks.
    let second_bytes = payload(90, 11);
    let second = store.store_payload(&second_bytes, first.records).unwrap();
    assert!(second.records.len() < first_len);
    assert!(!second.released.is_empty());

    let third_bytes = payload(600, 13);
    let third = store.store_payload(&third_bytes, second.records).unwrap();

    let records = store
        .get_records(third.start_id(), LoadMode::Normal, true)
        .unwrap();
    assert_eq!(store.read_full_byte_array(&records).unwrap(), third_bytes);
}

#[test]
fn test_watermark_checkpoint_and_recovery() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("meta.store");

    {
        let meta = MetadataStore::open(&path, &config()).unwrap();
        // Transactions 2..=6 close out of order; 8 stays ahead of a gap.
        for tx_id in [3, 2, 5, 4, 6, 8] {
            meta.transaction_closed(tx_id, 2, tx_id * 128);
        }
        assert_eq!(meta.last_closed_transaction_id(), 6);
        assert_eq!(meta.highest_closed_transaction_ever(), 8);
        meta.checkpoint().unwrap();
        // Crash without close.
    }

    let meta = MetadataStore::open(&path, &config()).unwrap();
    // Only the gap-free watermark was durable; the orphaned 8 was not.
    let (tx_id, [log_version, byte_offset]) = meta.last_closed_transaction();
    assert_eq!(tx_id, 6);
    assert_eq!(log_version, 2);
    assert_eq!(byte_offset, 6 * 128);
    assert_eq!(meta.highest_closed_transaction_ever(), 6);

    // Replay continues from the watermark.
    assert!(meta.transaction_closed(7, 2, 7 * 128));
    assert_eq!(meta.last_closed_transaction_id(), 7);
}

#[test]
fn test_concurrent_appliers_and_waiters() {
    use std::sync::Arc;
    use std::thread;

    let dir = TempDir::new().unwrap();
    let meta = Arc::new(MetadataStore::open(&dir.path().join("meta.store"), &config()).unwrap());

    let waiter = {
        let meta = Arc::clone(&meta);
        thread::spawn(move || meta.await_closed_transaction(801, Duration::from_secs(30)))
    };

    let mut appliers = vec![];
    for lane in 0..8u64 {
        let meta = Arc::clone(&meta);
        appliers.push(thread::spawn(move || {
            for round in 0..100u64 {
                let tx_id = round * 8 + lane + 2;
                meta.transaction_closed(tx_id, 0, tx_id);
            }
        }));
    }
    for applier in appliers {
        applier.join().unwrap();
    }
    waiter.join().unwrap().unwrap();
    assert_eq!(meta.last_closed_transaction_id(), 801);
}

#[test]
fn test_store_identity_is_stable_across_sessions() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("meta.store");

    let random = {
        let meta = MetadataStore::open(&path, &config()).unwrap();
        let random = meta.get(MetaPosition::RandomId).unwrap();
        meta.close().unwrap();
        random
    };
    for _ in 0..2 {
        let meta = MetadataStore::open(&path, &config()).unwrap();
        assert_eq!(meta.get(MetaPosition::RandomId).unwrap(), random);
        meta.close().unwrap();
    }
}
