//! Metadata store
//!
//! A small fixed record store holding one u64 value per well-known
//! position: store identity (version, creation time, random token) and the
//! last-closed-transaction triple. The triple seeds an
//! [`OutOfOrderSequence`] on open, so concurrent transaction appliers can
//! report completion out of order while the store tracks the gap-free
//! watermark; `checkpoint` persists the current watermark back into the
//! records.

use crate::error::Result;
use crate::sequence::OutOfOrderSequence;
use crate::store::StoreConfig;
use crate::store::fixed::FixedRecordStore;
use crate::store::record::{LoadMode, RecordCodec, StoreHeader, StoreRecord};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// First transaction id of an empty store
pub const BASE_TRANSACTION_ID: u64 = 1;

/// Version word written to fresh metadata stores
const METADATA_FORMAT: u64 = 1;

const META_RECORD_SIZE: u32 = 9;
const FLAG_IN_USE: u8 = 0x01;

/// Well-known slots of the metadata store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum MetaPosition {
    /// Metadata format version
    StoreVersion = 0,
    /// Creation time in milliseconds since the epoch
    CreationTime = 1,
    /// Random token identifying this store instance
    RandomId = 2,
    /// Highest gap-free closed transaction id
    LastClosedTransactionId = 3,
    /// Log version of the last closed transaction
    LastClosedLogVersion = 4,
    /// Byte offset of the last closed transaction in its log
    LastClosedByteOffset = 5,
}

/// One metadata value record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaRecord {
    /// Record id (reserved ids + position)
    pub id: u64,
    /// Whether the slot holds a value
    pub in_use: bool,
    /// Whether the record was freshly created
    pub created: bool,
    /// The stored value
    pub value: u64,
}

impl StoreRecord for MetaRecord {
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
    fn in_use(&self) -> bool {
        self.in_use
    }
    fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }
    fn is_created(&self) -> bool {
        self.created
    }
    fn clear(&mut self) {
        *self = Self {
            id: self.id,
            ..Self::default()
        };
    }
}

/// Codec for 9-byte metadata value records
pub struct MetaCodec;

impl RecordCodec for MetaCodec {
    type Record = MetaRecord;

    fn type_descriptor(&self) -> &'static str {
        "metadata"
    }

    fn store_header(&self) -> StoreHeader {
        StoreHeader {
            record_size: META_RECORD_SIZE,
            data: 0,
        }
    }

    fn max_id(&self) -> u64 {
        1 << 16
    }

    fn is_in_use(&self, bytes: &[u8]) -> bool {
        bytes[0] & FLAG_IN_USE != 0
    }

    fn decode(&self, bytes: &[u8], record: &mut MetaRecord, _mode: LoadMode) -> Result<()> {
        record.in_use = bytes[0] & FLAG_IN_USE != 0;
        record.value = u64::from_le_bytes(bytes[1..9].try_into().unwrap_or([0; 8]));
        Ok(())
    }

    fn encode(&self, record: &MetaRecord, bytes: &mut [u8]) {
        bytes[0] = if record.in_use { FLAG_IN_USE } else { 0 };
        bytes[1..9].copy_from_slice(&record.value.to_le_bytes());
    }
}

/// Store identity and last-closed-transaction tracking.
pub struct MetadataStore {
    store: FixedRecordStore<MetaCodec>,
    last_closed: OutOfOrderSequence,
}

impl MetadataStore {
    /// Open (or create) the metadata store and seed the
    /// last-closed-transaction sequence from the persisted triple.
    pub fn open(path: &Path, config: &StoreConfig) -> Result<Self> {
        let store = FixedRecordStore::open(path, MetaCodec, config)?;

        let initialized = {
            let probe = store.get_record(
                record_id(&store, MetaPosition::StoreVersion),
                LoadMode::Check,
            )?;
            probe.in_use
        };
        if !initialized {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_millis() as u64;
            set_value(&store, MetaPosition::StoreVersion, METADATA_FORMAT)?;
            set_value(&store, MetaPosition::CreationTime, now)?;
            set_value(&store, MetaPosition::RandomId, rand::random::<u64>())?;
            set_value(
                &store,
                MetaPosition::LastClosedTransactionId,
                BASE_TRANSACTION_ID,
            )?;
            set_value(&store, MetaPosition::LastClosedLogVersion, 0)?;
            set_value(&store, MetaPosition::LastClosedByteOffset, 0)?;
            store.flush()?;
            debug!(store = %path.display(), "initialized metadata records");
        }

        let tx_id = get_value(&store, MetaPosition::LastClosedTransactionId)?;
        let log_version = get_value(&store, MetaPosition::LastClosedLogVersion)?;
        let byte_offset = get_value(&store, MetaPosition::LastClosedByteOffset)?;
        let last_closed = OutOfOrderSequence::new(tx_id, &[log_version, byte_offset]);

        Ok(Self { store, last_closed })
    }

    /// Read the value at a position
    pub fn get(&self, position: MetaPosition) -> Result<u64> {
        get_value(&self.store, position)
    }

    /// Write the value at a position
    pub fn set(&self, position: MetaPosition, value: u64) -> Result<()> {
        set_value(&self.store, position, value)
    }

    /// Report a transaction as durably closed. Returns `true` when the
    /// gap-free watermark advanced.
    pub fn transaction_closed(&self, tx_id: u64, log_version: u64, byte_offset: u64) -> bool {
        self.last_closed.offer(tx_id, &[log_version, byte_offset])
    }

    /// Highest gap-free closed transaction with its (log version, byte
    /// offset) metadata
    pub fn last_closed_transaction(&self) -> (u64, [u64; 2]) {
        let (tx_id, meta) = self.last_closed.get();
        (tx_id, [meta[0], meta[1]])
    }

    /// Highest gap-free closed transaction id
    pub fn last_closed_transaction_id(&self) -> u64 {
        self.last_closed.highest_gap_free()
    }

    /// Highest transaction id ever reported closed, regardless of gaps
    pub fn highest_closed_transaction_ever(&self) -> u64 {
        self.last_closed.highest_ever_seen()
    }

    /// Block until transactions up to `tx_id` have closed, or time out
    pub fn await_closed_transaction(&self, tx_id: u64, timeout: Duration) -> Result<()> {
        self.last_closed.await_number(tx_id, timeout)
    }

    /// Reset the last-closed triple (recovery)
    pub fn set_last_closed_transaction(&self, tx_id: u64, log_version: u64, byte_offset: u64) {
        self.last_closed.set(tx_id, &[log_version, byte_offset]);
    }

    /// Persist the current gap-free triple and flush the store
    pub fn checkpoint(&self) -> Result<()> {
        let (tx_id, [log_version, byte_offset]) = self.last_closed_transaction();
        set_value(&self.store, MetaPosition::LastClosedTransactionId, tx_id)?;
        set_value(&self.store, MetaPosition::LastClosedLogVersion, log_version)?;
        set_value(&self.store, MetaPosition::LastClosedByteOffset, byte_offset)?;
        self.store.flush()?;
        debug!(tx_id, "checkpointed last closed transaction");
        Ok(())
    }

    /// The underlying fixed record store
    pub fn store(&self) -> &FixedRecordStore<MetaCodec> {
        &self.store
    }

    /// Checkpoint and close, leaving a trusted id file behind
    pub fn close(self) -> Result<()> {
        self.checkpoint()?;
        self.store.close()
    }
}

fn record_id(store: &FixedRecordStore<MetaCodec>, position: MetaPosition) -> u64 {
    store.reserved_low_ids() + position as u64
}

fn get_value(store: &FixedRecordStore<MetaCodec>, position: MetaPosition) -> Result<u64> {
    Ok(store
        .get_record(record_id(store, position), LoadMode::Normal)?
        .value)
}

fn set_value(store: &FixedRecordStore<MetaCodec>, position: MetaPosition, value: u64) -> Result<()> {
    let id = record_id(store, position);
    let existing = store.get_record(id, LoadMode::Check)?;
    let record = MetaRecord {
        id,
        in_use: true,
        created: !existing.in_use,
        value,
    };
    store.update_record(&record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_meta(dir: &TempDir) -> MetadataStore {
        MetadataStore::open(&dir.path().join("meta.store"), &StoreConfig::default()).unwrap()
    }

    #[test]
    fn test_fresh_store_is_initialized() {
        let dir = TempDir::new().unwrap();
        let meta = open_meta(&dir);
        assert_eq!(meta.get(MetaPosition::StoreVersion).unwrap(), 1);
        assert!(meta.get(MetaPosition::CreationTime).unwrap() > 0);
        assert_eq!(meta.last_closed_transaction_id(), BASE_TRANSACTION_ID);
    }

    #[test]
    fn test_identity_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.store");
        let (created, random) = {
            let meta = MetadataStore::open(&path, &StoreConfig::default()).unwrap();
            let pair = (
                meta.get(MetaPosition::CreationTime).unwrap(),
                meta.get(MetaPosition::RandomId).unwrap(),
            );
            meta.close().unwrap();
            pair
        };
        let meta = MetadataStore::open(&path, &StoreConfig::default()).unwrap();
        assert_eq!(meta.get(MetaPosition::CreationTime).unwrap(), created);
        assert_eq!(meta.get(MetaPosition::RandomId).unwrap(), random);
    }

    #[test]
    fn test_out_of_order_transaction_closing() {
        let dir = TempDir::new().unwrap();
        let meta = open_meta(&dir);

        assert!(meta.transaction_closed(2, 0, 100));
        assert!(!meta.transaction_closed(4, 0, 300));
        assert_eq!(meta.last_closed_transaction_id(), 2);
        assert_eq!(meta.highest_closed_transaction_ever(), 4);

        assert!(meta.transaction_closed(3, 0, 200));
        let (tx_id, [log_version, byte_offset]) = meta.last_closed_transaction();
        assert_eq!(tx_id, 4);
        assert_eq!(log_version, 0);
        assert_eq!(byte_offset, 300);
    }

    #[test]
    fn test_checkpoint_persists_watermark() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.store");
        {
            let meta = MetadataStore::open(&path, &StoreConfig::default()).unwrap();
            for tx_id in 2..=9 {
                meta.transaction_closed(tx_id, 1, tx_id * 64);
            }
            meta.close().unwrap();
        }
        let meta = MetadataStore::open(&path, &StoreConfig::default()).unwrap();
        let (tx_id, [log_version, byte_offset]) = meta.last_closed_transaction();
        assert_eq!(tx_id, 9);
        assert_eq!(log_version, 1);
        assert_eq!(byte_offset, 9 * 64);
    }

    #[test]
    fn test_await_closed_transaction() {
        use std::sync::Arc;
        use std::thread;

        let dir = TempDir::new().unwrap();
        let meta = Arc::new(open_meta(&dir));

        meta.await_closed_transaction(BASE_TRANSACTION_ID, Duration::from_millis(1))
            .unwrap();

        let waiter = {
            let meta = Arc::clone(&meta);
            thread::spawn(move || meta.await_closed_transaction(3, Duration::from_secs(10)))
        };
        meta.transaction_closed(2, 0, 0);
        meta.transaction_closed(3, 0, 0);
        waiter.join().unwrap().unwrap();

        let err = meta
            .await_closed_transaction(100, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, crate::Error::Timeout(_)));
    }

    #[test]
    fn test_recovery_reset() {
        let dir = TempDir::new().unwrap();
        let meta = open_meta(&dir);
        meta.transaction_closed(2, 0, 10);
        meta.set_last_closed_transaction(40, 3, 4096);
        assert_eq!(meta.last_closed_transaction(), (40, [3, 4096]));
    }
}
