//! Error types for the Lattice record storage core

use thiserror::Error;

/// Result type alias using the Lattice storage Error
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the record storage layer
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from storage operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Page cache / paged file errors
    #[error("Page cache error: {0}")]
    PageCache(String),

    /// An access went outside the addressable range of a page, or the
    /// store file itself could not be used at the page level
    #[error("Underlying storage error: {0}")]
    UnderlyingStorage(String),

    /// The store file is missing, zero-length, or its header is unreadable
    #[error("Store not found: {0}")]
    StoreNotFound(String),

    /// A NORMAL-mode read found the record not in use or structurally invalid
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// A dynamic record chain revisited a block before terminating
    #[error(
        "Cycle detected in record chain starting at id {start_id}, found id {conflicting_id} twice"
    )]
    RecordChainCycle {
        /// First block of the traversed chain
        start_id: u64,
        /// The id that was encountered a second time
        conflicting_id: u64,
    },

    /// An id beyond the record format's maximum was requested or written
    #[error("Id {id} exceeds the maximum representable id {max_id}")]
    IdCapacityExceeded {
        /// The offending id
        id: u64,
        /// Highest id the record format can address
        max_id: u64,
    },

    /// The reserved null-reference sentinel was used as a record id
    #[error("Id {0} is a reserved sentinel value and cannot address a record")]
    ReservedId(u64),

    /// A blocking wait did not complete within its deadline
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a page cache error
    pub fn page_cache(msg: impl Into<String>) -> Self {
        Self::PageCache(msg.into())
    }

    /// Create an underlying-storage (boundary fault) error
    pub fn underlying_storage(msg: impl Into<String>) -> Self {
        Self::UnderlyingStorage(msg.into())
    }

    /// Create a store-not-found error
    pub fn store_not_found(msg: impl Into<String>) -> Self {
        Self::StoreNotFound(msg.into())
    }

    /// Create an invalid-record error
    pub fn invalid_record(msg: impl Into<String>) -> Self {
        Self::InvalidRecord(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }
}
