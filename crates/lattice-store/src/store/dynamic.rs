//! Dynamic (chained) record store
//!
//! Variable-length payloads (strings, arrays, long token names) are stored
//! as linked chains of fixed-size blocks layered on a [`FixedRecordStore`].
//! Each block carries an in-use flag, a start-of-chain flag, the payload
//! length used within the block and a pointer to the next block (or
//! [`NULL_REFERENCE`]). Allocation prefers blocks handed back by the caller
//! (the previous version of the same logical value) before asking the id
//! allocator for fresh ones; traversal is a lazy cursor with an optional
//! cycle guard against corrupt next-pointers.
//!
//! Block layout: `flags (1) | length (4) | next (8) | payload`. The first
//! block of a chain may prefix its payload with a small type header used by
//! higher-level value decoding; this store treats it as opaque payload
//! bytes and preserves it byte for byte.

use crate::error::{Error, Result};
use crate::store::StoreConfig;
use crate::store::fixed::FixedRecordStore;
use crate::store::record::{LoadMode, NULL_REFERENCE, RecordCodec, StoreHeader, StoreRecord};
use std::collections::HashSet;
use std::path::Path;

/// Bytes of block metadata before the payload
pub const BLOCK_HEADER_SIZE: usize = 13;

/// Smallest allowed block size (one payload byte)
pub const MIN_BLOCK_SIZE: u32 = BLOCK_HEADER_SIZE as u32 + 1;

const FLAG_IN_USE: u8 = 0x01;
const FLAG_START: u8 = 0x02;

/// One block of a dynamic record chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicRecord {
    /// Block id (slot address)
    pub id: u64,
    /// Whether the slot holds live data
    pub in_use: bool,
    /// Whether the block was freshly allocated in the current operation
    pub created: bool,
    /// Whether this block starts a chain
    pub start_of_chain: bool,
    /// Id of the next block, or [`NULL_REFERENCE`]
    pub next: u64,
    /// Payload bytes used in this block
    pub data: Vec<u8>,
}

impl Default for DynamicRecord {
    fn default() -> Self {
        Self {
            id: 0,
            in_use: false,
            created: false,
            start_of_chain: false,
            next: NULL_REFERENCE,
            data: Vec::new(),
        }
    }
}

impl StoreRecord for DynamicRecord {
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

/// Codec for dynamic record blocks. The block size is fixed per store and
/// persisted in the store header, so reopening adopts whatever size the
/// store was created with.
pub struct DynamicRecordCodec {
    block_size: u32,
}

impl DynamicRecordCodec {
    /// Codec for blocks of `block_size` bytes (header + payload)
    pub fn new(block_size: u32) -> Self {
        Self { block_size }
    }
}

impl RecordCodec for DynamicRecordCodec {
    type Record = DynamicRecord;

    fn type_descriptor(&self) -> &'static str {
        "dynamic"
    }

    fn store_header(&self) -> StoreHeader {
        StoreHeader {
            record_size: self.block_size,
            data: self.block_size,
        }
    }

    fn record_size(&self, header: &StoreHeader) -> u32 {
        header.data
    }

    fn check_header(&self, header: &StoreHeader) -> Result<()> {
        if header.data < MIN_BLOCK_SIZE {
            return Err(Error::underlying_storage(format!(
                "Dynamic store header declares block size {}, below the minimum of {}",
                header.data, MIN_BLOCK_SIZE
            )));
        }
        Ok(())
    }

    fn max_id(&self) -> u64 {
        (1 << 36) - 1
    }

    fn is_in_use(&self, bytes: &[u8]) -> bool {
        bytes[0] & FLAG_IN_USE != 0
    }

    fn decode(&self, bytes: &[u8], record: &mut DynamicRecord, mode: LoadMode) -> Result<()> {
        let flags = bytes[0];
        record.in_use = flags & FLAG_IN_USE != 0;
        record.start_of_chain = flags & FLAG_START != 0;
        let length = u32::from_le_bytes(bytes[1..5].try_into().unwrap_or([0; 4])) as usize;
        record.next = u64::from_le_bytes(bytes[5..13].try_into().unwrap_or([0; 8]));

        let capacity = bytes.len() - BLOCK_HEADER_SIZE;
        if length > capacity {
            if mode == LoadMode::Normal {
                return Err(Error::invalid_record(format!(
                    "Dynamic block {} declares payload length {length} beyond its capacity of \
                     {capacity} bytes",
                    record.id
                )));
            }
            // Best-effort modes clamp to whatever is actually there.
            record.data = bytes[BLOCK_HEADER_SIZE..].to_vec();
            return Ok(());
        }
        record.data = bytes[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + length].to_vec();
        Ok(())
    }

    fn encode(&self, record: &DynamicRecord, bytes: &mut [u8]) {
        let mut flags = 0u8;
        if record.in_use {
            flags |= FLAG_IN_USE;
        }
        if record.start_of_chain {
            flags |= FLAG_START;
        }
        bytes[0] = flags;
        bytes[1..5].copy_from_slice(&(record.data.len() as u32).to_le_bytes());
        bytes[5..13].copy_from_slice(&record.next.to_le_bytes());
        bytes[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + record.data.len()]
            .copy_from_slice(&record.data);
    }

    fn next_reference(&self, record: &DynamicRecord) -> u64 {
        record.next
    }
}

/// A chain of blocks assembled by [`DynamicRecordStore::allocate_records`].
///
/// `records` is the new chain in order; `released` holds reuse blocks that
/// were not needed this time, already marked not-in-use so writing them
/// persists their deletion.
#[derive(Debug, Default)]
pub struct AllocatedChain {
    /// Blocks of the new chain, start block first
    pub records: Vec<DynamicRecord>,
    /// Leftover reuse blocks, marked not-in-use
    pub released: Vec<DynamicRecord>,
}

impl AllocatedChain {
    /// Id of the chain's start block
    pub fn start_id(&self) -> u64 {
        self.records.first().map_or(NULL_REFERENCE, |r| r.id)
    }
}

/// Stores payloads of arbitrary byte length as chains of fixed-size blocks.
pub struct DynamicRecordStore {
    store: FixedRecordStore<DynamicRecordCodec>,
}

impl DynamicRecordStore {
    /// Open a dynamic record store, creating it with `block_size` if it
    /// does not exist. An existing store keeps the block size recorded in
    /// its header.
    pub fn open(path: &Path, block_size: u32, config: &StoreConfig) -> Result<Self> {
        if block_size < MIN_BLOCK_SIZE {
            return Err(Error::storage(format!(
                "Block size {block_size} is below the minimum of {MIN_BLOCK_SIZE}"
            )));
        }
        let store = FixedRecordStore::open(path, DynamicRecordCodec::new(block_size), config)?;
        Ok(Self { store })
    }

    /// Payload capacity of one block
    pub fn payload_size(&self) -> usize {
        self.store.record_size() as usize - BLOCK_HEADER_SIZE
    }

    /// Split `payload` into a chain of blocks, reusing `reuse` blocks
    /// (the previous version of the same logical value) before requesting
    /// fresh ids. Only the first block carries the start-of-chain flag; the
    /// last block's next-pointer is [`NULL_REFERENCE`]. Nothing is written;
    /// pass the result to [`DynamicRecordStore::write_chain`].
    pub fn allocate_records(
        &self,
        payload: &[u8],
        reuse: Vec<DynamicRecord>,
    ) -> Result<AllocatedChain> {
        let payload_size = self.payload_size();
        let mut reuse = reuse.into_iter();
        let mut records = Vec::with_capacity(payload.len().div_ceil(payload_size).max(1));

        let mut offset = 0;
        loop {
            let chunk = payload.len().saturating_sub(offset).min(payload_size);
            let mut record = match reuse.next() {
                Some(mut existing) => {
                    existing.created = false;
                    existing
                }
                None => DynamicRecord {
                    id: self.store.next_id()?,
                    created: true,
                    ..DynamicRecord::default()
                },
            };
            record.in_use = true;
            record.start_of_chain = offset == 0;
            record.next = NULL_REFERENCE;
            record.data = payload[offset..offset + chunk].to_vec();
            records.push(record);

            offset += chunk;
            if offset >= payload.len() {
                break;
            }
        }
        for i in 0..records.len() - 1 {
            records[i].next = records[i + 1].id;
        }

        // Reuse blocks we no longer need get deleted when written.
        let released = reuse
            .map(|mut leftover| {
                leftover.in_use = false;
                leftover.created = false;
                leftover.start_of_chain = false;
                leftover.next = NULL_REFERENCE;
                leftover.data.clear();
                leftover
            })
            .collect();

        Ok(AllocatedChain { records, released })
    }

    /// Write an allocated chain (new blocks and released leftovers) under
    /// one marker scope.
    ///
    /// Blocks are written tail-first: a reader following next-pointers
    /// never reaches a block whose content has not been written yet.
    pub fn write_chain(&self, chain: &AllocatedChain) -> Result<()> {
        let mut marker = self.store.marker();
        for record in chain.records.iter().rev() {
            self.store.update_record_with(record, &mut marker)?;
        }
        for record in &chain.released {
            self.store.update_record_with(record, &mut marker)?;
        }
        Ok(())
    }

    /// Allocate and write `payload` as a new chain in one call.
    pub fn store_payload(&self, payload: &[u8], reuse: Vec<DynamicRecord>) -> Result<AllocatedChain> {
        let chain = self.allocate_records(payload, reuse)?;
        self.write_chain(&chain)?;
        Ok(chain)
    }

    /// Lazy, non-restartable traversal of the chain starting at `start_id`,
    /// following next-pointers until [`NULL_REFERENCE`].
    ///
    /// Under [`LoadMode::Normal`] the traversal fails on the first
    /// not-in-use block; under [`LoadMode::Force`] it continues through
    /// not-in-use blocks so recovery tooling can walk partially deleted
    /// chains. With `guard_cycles` the cursor tracks visited ids and fails
    /// with a chain-cycle error if a block repeats before the chain ends.
    pub fn records(&self, start_id: u64, mode: LoadMode, guard_cycles: bool) -> ChainCursor<'_> {
        ChainCursor {
            store: &self.store,
            start_id,
            next_id: start_id,
            mode,
            visited: guard_cycles.then(HashSet::new),
            finished: false,
        }
    }

    /// Read a whole chain eagerly into a vector.
    pub fn get_records(
        &self,
        start_id: u64,
        mode: LoadMode,
        guard_cycles: bool,
    ) -> Result<Vec<DynamicRecord>> {
        self.records(start_id, mode, guard_cycles).collect()
    }

    /// Concatenate the payloads of a traversed chain into the original
    /// byte sequence.
    ///
    /// Every block but the last must use its full payload capacity; a
    /// shorter inner block means the chain's encoded lengths disagree with
    /// its structure, which is fatal even for forensic reads.
    pub fn read_full_byte_array(&self, records: &[DynamicRecord]) -> Result<Vec<u8>> {
        let payload_size = self.payload_size();
        let mut bytes = Vec::with_capacity(records.len() * payload_size);
        for (index, record) in records.iter().enumerate() {
            if record.data.len() > payload_size {
                return Err(Error::invalid_record(format!(
                    "Dynamic block {} holds {} payload bytes, beyond the block capacity of {}",
                    record.id,
                    record.data.len(),
                    payload_size
                )));
            }
            if index + 1 < records.len() && record.data.len() != payload_size {
                return Err(Error::invalid_record(format!(
                    "Dynamic block {} is followed by block {} but uses only {} of {} payload \
                     bytes; chain length disagrees with its blocks",
                    record.id,
                    records[index + 1].id,
                    record.data.len(),
                    payload_size
                )));
            }
            bytes.extend_from_slice(&record.data);
        }
        Ok(bytes)
    }

    /// Delete the whole chain starting at `start_id`: every block is marked
    /// not-in-use and its id released under one marker scope. Returns the
    /// freed block ids.
    pub fn delete_chain(&self, start_id: u64) -> Result<Vec<u64>> {
        let records = self.get_records(start_id, LoadMode::Normal, true)?;
        let mut marker = self.store.marker();
        let mut freed = Vec::with_capacity(records.len());
        for mut record in records {
            record.in_use = false;
            record.created = false;
            self.store.update_record_with(&record, &mut marker)?;
            freed.push(record.id);
        }
        Ok(freed)
    }

    /// Read one block with the given strictness
    pub fn get_record(&self, id: u64, mode: LoadMode) -> Result<DynamicRecord> {
        self.store.get_record(id, mode)
    }

    /// Write one block
    pub fn update_record(&self, record: &DynamicRecord) -> Result<()> {
        self.store.update_record(record)
    }

    /// The underlying fixed record store
    pub fn store(&self) -> &FixedRecordStore<DynamicRecordCodec> {
        &self.store
    }

    /// Flush blocks to disk, then checkpoint the id allocator
    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    /// Flush and close, leaving a trusted id file behind
    pub fn close(self) -> Result<()> {
        self.store.close()
    }
}

/// Lazy, non-restartable cursor over one block chain
pub struct ChainCursor<'a> {
    store: &'a FixedRecordStore<DynamicRecordCodec>,
    start_id: u64,
    next_id: u64,
    mode: LoadMode,
    visited: Option<HashSet<u64>>,
    finished: bool,
}

impl Iterator for ChainCursor<'_> {
    type Item = Result<DynamicRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.next_id == NULL_REFERENCE {
            return None;
        }
        let id = self.next_id;

        if let Some(visited) = &mut self.visited {
            if !visited.insert(id) {
                self.finished = true;
                return Some(Err(Error::RecordChainCycle {
                    start_id: self.start_id,
                    conflicting_id: id,
                }));
            }
        }

        match self.store.get_record(id, self.mode) {
            Ok(record) => {
                self.next_id = record.next;
                if !record.in_use && self.mode != LoadMode::Force {
                    // CHECK stops quietly at the first unused block.
                    self.finished = true;
                    return None;
                }
                Some(Ok(record))
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
