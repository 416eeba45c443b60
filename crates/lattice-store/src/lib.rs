//! Lattice Store - Record storage core for the Lattice graph database
//!
//! This crate provides the persistence primitives every Lattice entity
//! store (node, relationship, property, token, schema, metadata) is built
//! from:
//! - Fixed-size record stores over a paged file with optimistic
//!   torn-read retry and three read-strictness modes
//! - Dynamic (chained) record stores for variable-length payloads
//! - Crash-recoverable id allocation with scoped used/deleted markers
//! - An out-of-order completion sequence tracking the gap-free
//!   "last closed" watermark
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │         Entity Stores (via codecs)          │
//! │   node / relationship / property / token    │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │   FixedRecordStore / DynamicRecordStore     │
//! │  (slots, chains, load modes, high-id scan)  │
//! └────┬──────────────────┬─────────────────────┘
//!      │                  │
//! ┌────┴─────────┐  ┌─────┴────────────────────┐
//! │  PagedFile   │  │ IdAllocator / Sequence   │
//! │ (torn-read   │  │ (recycling, markers,     │
//! │  retry)      │  │  gap-free watermark)     │
//! └──────────────┘  └──────────────────────────┘
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod id;
pub mod page_cache;
pub mod sequence;
pub mod store;

pub use error::{Error, Result};
pub use id::{IdAllocator, IdMarker};
pub use page_cache::{PAGE_SIZE, PagedFile};
pub use sequence::OutOfOrderSequence;
pub use store::{
    DynamicRecord, DynamicRecordStore, FixedRecordStore, LoadMode, MetadataStore, NULL_REFERENCE,
    RecordCodec, StoreConfig, StoreHeader, StoreRecord,
};
