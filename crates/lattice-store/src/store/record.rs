//! Record capability traits and load-mode policy
//!
//! Entity-specific behavior is a value, not a subclass: a concrete store is
//! a [`crate::store::FixedRecordStore`] parameterized by a [`RecordCodec`]
//! supplying the record size, the in-use probe and the decode/encode pair
//! for one record kind. Records themselves expose a small common surface
//! through [`StoreRecord`] (id, in-use flag, created flag, secondary unit
//! bookkeeping) that the generic store uses for id accounting.

use crate::{Error, Result};

/// Null record reference: marks "no next block" in chains and is the
/// reserved id no allocator ever hands out.
pub const NULL_REFERENCE: u64 = u64::MAX;

/// Magic tag identifying a Lattice store file
pub const STORE_MAGIC: u32 = 0x4C54_5253;

/// On-disk store format version
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Size in bytes of the store header written at the start of page 0
pub const STORE_HEADER_SIZE: usize = 16;

/// How strict a record read is about what it finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Decode and fail with an invalid-record error if the record is not
    /// in use or its on-disk shape is invalid
    #[default]
    Normal,
    /// Decode best-effort and return without raising on not-in-use;
    /// used for optimistic lookups
    Check,
    /// Always decode whatever bytes are present, in use or not; used by
    /// recovery and consistency tooling
    Force,
}

impl LoadMode {
    /// Whether record contents should be decoded given the in-use flag
    pub(crate) fn should_load(self, in_use: bool) -> bool {
        in_use || self == LoadMode::Force
    }

    /// Verify a record after its slot was read
    pub(crate) fn verify_after_read(self, in_use: bool, id: u64) -> Result<()> {
        if self == LoadMode::Normal && !in_use {
            return Err(Error::invalid_record(format!("Record {id} not in use")));
        }
        Ok(())
    }

    /// Verify after the slot could not be read at all (beyond end of file)
    pub(crate) fn verify_after_not_read(self, id: u64) -> Result<()> {
        if self == LoadMode::Normal {
            return Err(Error::invalid_record(format!(
                "Record {id} is beyond the end of the store"
            )));
        }
        Ok(())
    }
}

/// Store header persisted at the start of page 0.
///
/// Written once at creation and re-validated on every open. `data` carries
/// one entity-specific word (dynamic stores keep their block size there).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHeader {
    /// Size of every record slot in bytes
    pub record_size: u32,
    /// Entity-specific header word
    pub data: u32,
}

/// Common surface of every record kind, used by the generic store for
/// reading, writing and id accounting.
pub trait StoreRecord: Clone + Default {
    /// Record id (slot address)
    fn id(&self) -> u64;
    /// Set the record id
    fn set_id(&mut self, id: u64);
    /// Whether the slot holds live data
    fn in_use(&self) -> bool;
    /// Set the in-use flag
    fn set_in_use(&mut self, in_use: bool);
    /// Whether the record was freshly created in the current operation
    fn is_created(&self) -> bool;
    /// Reset all fields to the empty, not-in-use state, keeping the id
    fn clear(&mut self);

    /// Whether the record's payload needs a linked auxiliary slot
    fn requires_secondary_unit(&self) -> bool {
        false
    }
    /// Id of the linked auxiliary slot, or [`NULL_REFERENCE`]
    fn secondary_unit_id(&self) -> u64 {
        NULL_REFERENCE
    }
    /// Whether a secondary unit id has been assigned
    fn has_secondary_unit_id(&self) -> bool {
        self.secondary_unit_id() != NULL_REFERENCE
    }
    /// Whether the secondary unit was assigned in the current operation
    fn is_secondary_unit_created(&self) -> bool {
        false
    }
}

/// Per-record-kind codec capability: sizes, in-use probe, decode/encode.
pub trait RecordCodec: Send + Sync {
    /// Record type this codec reads and writes
    type Record: StoreRecord;

    /// Short name used in log and error messages
    fn type_descriptor(&self) -> &'static str;

    /// Header to write when creating a new store of this kind
    fn store_header(&self) -> StoreHeader;

    /// Record size given the store header read from disk
    fn record_size(&self, header: &StoreHeader) -> u32 {
        header.record_size
    }

    /// Validate a header read from disk against this codec
    fn check_header(&self, header: &StoreHeader) -> Result<()> {
        let expected = self.store_header().record_size;
        if header.record_size != expected {
            return Err(Error::underlying_storage(format!(
                "{} store header declares record size {} but this format requires {}",
                self.type_descriptor(),
                header.record_size,
                expected
            )));
        }
        Ok(())
    }

    /// Highest id this record format can address
    fn max_id(&self) -> u64;

    /// Probe the in-use flag without decoding the whole record
    fn is_in_use(&self, bytes: &[u8]) -> bool;

    /// Decode a record from its slot bytes.
    ///
    /// Must be a pure function of `bytes`: the store re-invokes it after
    /// torn reads. `mode` selects how strict decoding is about invalid
    /// shapes ([`LoadMode::Force`] decodes whatever is present).
    fn decode(&self, bytes: &[u8], record: &mut Self::Record, mode: LoadMode) -> Result<()>;

    /// Encode a record into its slot bytes (`bytes.len()` == record size)
    fn encode(&self, record: &Self::Record, bytes: &mut [u8]);

    /// Encode the secondary-unit slot for a record that requires one
    fn encode_secondary(&self, _record: &Self::Record, _bytes: &mut [u8]) {}

    /// Chain link: id of the next record, or [`NULL_REFERENCE`]
    fn next_reference(&self, _record: &Self::Record) -> u64 {
        NULL_REFERENCE
    }
}
