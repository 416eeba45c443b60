//! Record stores
//!
//! Every concrete store is a composition of the same parts: a
//! [`FixedRecordStore`] mapping ids onto equal-size slots of a paged file,
//! a [`crate::id::IdAllocator`] owning the id space, and — for
//! variable-length payloads — a [`DynamicRecordStore`] chaining fixed-size
//! blocks. Entity-specific record layouts plug in as [`RecordCodec`]
//! values rather than store subclasses.

mod dynamic;
mod fixed;
mod meta;
mod record;

pub use dynamic::{
    AllocatedChain, BLOCK_HEADER_SIZE, ChainCursor, DynamicRecord, DynamicRecordCodec,
    DynamicRecordStore, MIN_BLOCK_SIZE,
};
pub use fixed::{FixedRecordStore, RecordScan, StoreStats};
pub use meta::{BASE_TRANSACTION_ID, MetaCodec, MetaPosition, MetaRecord, MetadataStore};
pub use record::{
    LoadMode, NULL_REFERENCE, RecordCodec, STORE_FORMAT_VERSION, STORE_HEADER_SIZE, STORE_MAGIC,
    StoreHeader, StoreRecord,
};

use crate::page_cache::PAGE_SIZE;

/// Configuration for opening record stores
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Page size of the backing file in bytes
    pub page_size: usize,
    /// Create the store (header and id file) if the file does not exist
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            create_if_missing: true,
        }
    }
}
