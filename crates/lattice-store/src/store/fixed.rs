//! Fixed-size record store
//!
//! A [`FixedRecordStore`] maps record ids onto equal-size slots of a paged
//! store file. Reads go through the page file's optimistic retry protocol
//! with three strictness levels ([`LoadMode`]); writes keep the paired
//! [`IdAllocator`] in sync, including the bookkeeping for records that
//! spill into a secondary unit slot. When the allocator's persisted state
//! is missing or untrustworthy the store heals itself by scanning for the
//! highest in-use record and re-deriving the free list.

use crate::error::{Error, Result};
use crate::id::{IdAllocator, IdMarker};
use crate::page_cache::PagedFile;
use crate::store::StoreConfig;
use crate::store::record::{
    LoadMode, RecordCodec, STORE_FORMAT_VERSION, STORE_HEADER_SIZE, STORE_MAGIC, StoreHeader,
    StoreRecord,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Store statistics snapshot
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// One past the highest id ever allocated
    pub high_id: u64,
    /// Ids currently allocated and not freed
    pub ids_in_use: u64,
    /// Size of the store file in bytes
    pub file_size: u64,
    /// Record slot size in bytes
    pub record_size: u32,
}

/// Durable mapping `id -> fixed-size record` for one record kind.
pub struct FixedRecordStore<C: RecordCodec> {
    codec: C,
    file: PagedFile,
    ids: IdAllocator,
    header: StoreHeader,
    record_size: u32,
    records_per_page: u32,
    reserved_low_ids: u64,
    path: PathBuf,
}

impl<C: RecordCodec> FixedRecordStore<C> {
    /// Open a record store, creating it if allowed by `config`.
    ///
    /// Creation writes the store header and a fresh id file. Opening
    /// re-validates the header; a header cut short by truncation is
    /// completed transparently, while a zero-length or missing file is
    /// "store not found". A missing or untrustworthy id file triggers the
    /// self-healing high-id/free-id scan.
    pub fn open(path: &Path, codec: C, config: &StoreConfig) -> Result<Self> {
        if STORE_HEADER_SIZE > config.page_size {
            return Err(Error::underlying_storage(format!(
                "Out of page bounds for the {} store header; page size of {} bytes is too small",
                codec.type_descriptor(),
                config.page_size
            )));
        }

        let raw_len = match std::fs::metadata(path) {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        match raw_len {
            None if !config.create_if_missing => {
                return Err(Error::store_not_found(format!(
                    "Store file not found: {}",
                    path.display()
                )));
            }
            Some(0) => {
                return Err(Error::store_not_found(format!(
                    "Zero-length store file: {}",
                    path.display()
                )));
            }
            _ => {}
        }

        let creating = raw_len.is_none();
        if let Some(len) = raw_len {
            if len % config.page_size as u64 != 0 {
                debug!(
                    store = %path.display(),
                    "store file length {len} is not page-aligned, completing the tail page"
                );
            }
        }

        let file = PagedFile::open(path, config.page_size, creating)?;
        let id_path = id_file_path(path);

        let store = if creating {
            let header = codec.store_header();
            let store = Self::initialize(codec, file, header, path, &id_path, true, true)?;
            info!(
                store = %path.display(),
                record_size = store.record_size,
                "created {} store",
                store.codec.type_descriptor()
            );
            store
        } else {
            let ((magic, version, mut header), out_of_bounds) = file
                .read_page(0, |page| {
                    (
                        page.read_u32(0),
                        page.read_u32(4),
                        StoreHeader {
                            record_size: page.read_u32(8),
                            data: page.read_u32(12),
                        },
                    )
                })?
                .ok_or_else(|| Error::page_cache("Store file has no pages"))?;
            if out_of_bounds {
                return Err(Error::underlying_storage(format!(
                    "Out of page bounds when reading the store header of {}",
                    path.display()
                )));
            }

            let rewrite_header = if (raw_len.unwrap_or(0) as usize) < STORE_HEADER_SIZE {
                // The file was truncated into the header region; complete it
                // from the codec's defaults instead of treating it as corrupt.
                info!(store = %path.display(), "completing partial store header");
                header = codec.store_header();
                true
            } else if magic != STORE_MAGIC || version != STORE_FORMAT_VERSION {
                return Err(Error::underlying_storage(format!(
                    "{} is not a readable store file (magic {magic:#010x}, format version {version})",
                    path.display()
                )));
            } else {
                codec.check_header(&header)?;
                false
            };
            Self::initialize(codec, file, header, path, &id_path, rewrite_header, false)?
        };

        if store.ids.needs_rebuild() {
            warn!(
                store = %path.display(),
                "id state for {} store is missing or stale, rebuilding from store scan",
                store.codec.type_descriptor()
            );
            let high_id = store.scan_for_high_id()?;
            let free = store.scan_free_ids(high_id)?;
            store.ids.rebuild(high_id, free)?;
            debug!(store = %path.display(), high_id, "rebuilt id allocator");
        }
        Ok(store)
    }

    fn initialize(
        codec: C,
        file: PagedFile,
        header: StoreHeader,
        path: &Path,
        id_path: &Path,
        write_header: bool,
        create_ids: bool,
    ) -> Result<Self> {
        let record_size = codec.record_size(&header);
        let page_size = file.page_size();
        if record_size == 0 {
            return Err(Error::underlying_storage(format!(
                "{} store header declares a zero record size",
                codec.type_descriptor()
            )));
        }
        if record_size as usize > page_size {
            return Err(Error::underlying_storage(format!(
                "Record size {} of the {} store exceeds the page capacity of {} bytes",
                record_size,
                codec.type_descriptor(),
                page_size
            )));
        }

        if write_header {
            let ((), out_of_bounds) = file
                .write_page(0, true, |page| {
                    page.write_u32(0, STORE_MAGIC);
                    page.write_u32(4, STORE_FORMAT_VERSION);
                    page.write_u32(8, header.record_size);
                    page.write_u32(12, header.data);
                })?
                .ok_or_else(|| Error::page_cache("Store file has no pages"))?;
            if out_of_bounds {
                return Err(Error::underlying_storage(format!(
                    "Out of page bounds when writing the store header of {}",
                    path.display()
                )));
            }
            file.flush()?;
        }

        let reserved_low_ids = (STORE_HEADER_SIZE as u64).div_ceil(record_size as u64);
        let ids = if create_ids {
            // A stale id file from an earlier store must not be trusted.
            IdAllocator::create(id_path, reserved_low_ids, codec.max_id())?
        } else {
            IdAllocator::open(id_path, reserved_low_ids, codec.max_id())?
        };

        Ok(Self {
            codec,
            records_per_page: page_size as u32 / record_size,
            record_size,
            header,
            ids,
            file,
            reserved_low_ids,
            path: path.to_path_buf(),
        })
    }

    /// Produce an empty, not-in-use record shell
    pub fn new_record(&self) -> C::Record {
        C::Record::default()
    }

    /// Read the record at `id` with the given strictness.
    pub fn get_record(&self, id: u64, mode: LoadMode) -> Result<C::Record> {
        let mut record = C::Record::default();
        self.get_record_into(id, &mut record, mode)?;
        Ok(record)
    }

    /// Read the record at `id` into an existing record shell.
    ///
    /// The decode runs under the page file's torn-read retry loop and is
    /// re-invoked from scratch until a clean read completes; no partial
    /// decode ever reaches `record`.
    pub fn get_record_into(&self, id: u64, record: &mut C::Record, mode: LoadMode) -> Result<()> {
        record.clear();
        record.set_id(id);
        if id > self.codec.max_id() {
            return Err(Error::underlying_storage(format!(
                "Record id {id} is outside the addressable range of the {} store (max id {})",
                self.codec.type_descriptor(),
                self.codec.max_id()
            )));
        }

        let page_id = self.page_id_for_record(id);
        let offset = self.offset_for_id(id);
        let record_size = self.record_size as usize;
        let read = self.file.read_page(page_id, |page| {
            let mut buf = vec![0u8; record_size];
            page.read_bytes(offset, &mut buf);
            buf
        })?;
        let Some((bytes, out_of_bounds)) = read else {
            return mode.verify_after_not_read(id);
        };
        if out_of_bounds {
            return Err(self.out_of_bounds_error(id, page_id, offset));
        }

        let in_use = self.codec.is_in_use(&bytes);
        if mode.should_load(in_use) {
            self.codec.decode(&bytes, record, mode)?;
        }
        record.set_in_use(in_use);
        mode.verify_after_read(in_use, id)
    }

    /// Write the record's current state at its id's slot, reporting id
    /// transitions (created, deleted, secondary unit gained/lost) to the
    /// id allocator under a marker scoped to this update.
    pub fn update_record(&self, record: &C::Record) -> Result<()> {
        let mut marker = self.ids.marker();
        self.update_record_with(record, &mut marker)
    }

    /// Like [`FixedRecordStore::update_record`] but sharing a caller-owned
    /// marker so several record updates form one durability unit.
    pub fn update_record_with(&self, record: &C::Record, marker: &mut IdMarker<'_>) -> Result<()> {
        let id = record.id();
        self.assert_valid_id(id)?;
        if record.has_secondary_unit_id() {
            self.assert_valid_id(record.secondary_unit_id())?;
        }

        let mut bytes = vec![0u8; self.record_size as usize];
        self.codec.encode(record, &mut bytes);
        self.write_slot(id, &bytes)?;

        if record.in_use() && record.requires_secondary_unit() && record.has_secondary_unit_id() {
            bytes.fill(0);
            self.codec.encode_secondary(record, &mut bytes);
            self.write_slot(record.secondary_unit_id(), &bytes)?;
        }

        if !record.in_use() {
            marker.mark_deleted(id);
        } else if record.is_created() {
            marker.mark_used(id);
        }
        if (!record.in_use() || !record.requires_secondary_unit()) && record.has_secondary_unit_id()
        {
            // The record was deleted just now, or used a secondary unit but
            // no longer does: either way that unit's id is free again.
            marker.mark_deleted(record.secondary_unit_id());
        }
        if record.in_use() && record.is_secondary_unit_created() {
            marker.mark_used(record.secondary_unit_id());
        }
        Ok(())
    }

    fn write_slot(&self, id: u64, bytes: &[u8]) -> Result<()> {
        let page_id = self.page_id_for_record(id);
        let offset = self.offset_for_id(id);
        let ((), out_of_bounds) = self
            .file
            .write_page(page_id, true, |page| page.write_bytes(offset, bytes))?
            .ok_or_else(|| Error::page_cache(format!("Page {page_id} was not grown")))?;
        if out_of_bounds {
            return Err(self.out_of_bounds_error(id, page_id, offset));
        }
        Ok(())
    }

    /// Next free id from this store's allocator
    pub fn next_id(&self) -> Result<u64> {
        self.ids.next_id()
    }

    /// Scoped id marker for batching several updates into one durability unit
    pub fn marker(&self) -> IdMarker<'_> {
        self.ids.marker()
    }

    /// Whether the record at `id` is in use (retry-safe flag probe)
    pub fn is_in_use(&self, id: u64) -> Result<bool> {
        if id > self.codec.max_id() {
            return Err(Error::underlying_storage(format!(
                "Record id {id} is outside the addressable range of the {} store",
                self.codec.type_descriptor()
            )));
        }
        let page_id = self.page_id_for_record(id);
        let offset = self.offset_for_id(id);
        let record_size = self.record_size as usize;
        let read = self.file.read_page(page_id, |page| {
            let mut buf = vec![0u8; record_size];
            page.read_bytes(offset, &mut buf);
            self.codec.is_in_use(&buf)
        })?;
        match read {
            Some((_, true)) => Err(self.out_of_bounds_error(id, page_id, offset)),
            Some((in_use, false)) => Ok(in_use),
            None => Ok(false),
        }
    }

    /// Raw bytes of one record slot, regardless of in-use state.
    /// Should only be used by tests and tooling.
    pub fn raw_record_data(&self, id: u64) -> Result<Vec<u8>> {
        let record_size = self.record_size as usize;
        let page_id = self.page_id_for_record(id);
        let offset = self.offset_for_id(id);
        let read = self.file.read_page(page_id, |page| {
            let mut buf = vec![0u8; record_size];
            page.read_bytes(offset, &mut buf);
            buf
        })?;
        Ok(match read {
            Some((buf, _)) => buf,
            None => vec![0u8; record_size],
        })
    }

    /// Lazy, restartable, forward-only sequence of the in-use records from
    /// the first non-reserved id up to the current high id.
    pub fn records(&self) -> RecordScan<'_, C> {
        RecordScan {
            store: self,
            next_id: self.reserved_low_ids,
            high_id: self.ids.high_id(),
        }
    }

    /// Visit every in-use record exactly once
    pub fn scan_all_records(
        &self,
        mut visitor: impl FnMut(C::Record) -> Result<()>,
    ) -> Result<()> {
        for record in self.records() {
            visitor(record?)?;
        }
        Ok(())
    }

    /// Recover the high id by scanning backward through the store file for
    /// the highest in-use record. Used when the id allocator's own durable
    /// state is missing.
    pub fn scan_for_high_id(&self) -> Result<u64> {
        let records_per_page = self.records_per_page as u64;
        let record_size = self.record_size as usize;
        for page_id in (0..=self.file.last_page_id()).rev() {
            let start_slot = if page_id == 0 {
                self.reserved_low_ids.min(records_per_page)
            } else {
                0
            };
            let scanned = self.file.read_page(page_id, |page| {
                let mut highest = None;
                let mut buf = vec![0u8; record_size];
                for slot in start_slot..records_per_page {
                    page.read_bytes(slot as usize * record_size, &mut buf);
                    if self.codec.is_in_use(&buf) {
                        highest = Some(slot);
                    }
                }
                highest
            })?;
            if let Some((Some(slot), _)) = scanned {
                return Ok(page_id * records_per_page + slot + 1);
            }
        }
        Ok(self.reserved_low_ids)
    }

    /// Collect every non-reserved id below `high_id` whose slot is not in
    /// use; feeds the id allocator rebuild.
    fn scan_free_ids(&self, high_id: u64) -> Result<Vec<u64>> {
        let records_per_page = self.records_per_page as u64;
        let record_size = self.record_size as usize;
        let mut free = Vec::new();
        for page_id in 0..=self.file.last_page_id() {
            let base = page_id * records_per_page;
            if base >= high_id {
                break;
            }
            let scanned = self.file.read_page(page_id, |page| {
                let mut ids = Vec::new();
                let mut buf = vec![0u8; record_size];
                for slot in 0..records_per_page {
                    let id = base + slot;
                    if id < self.reserved_low_ids {
                        continue;
                    }
                    if id >= high_id {
                        break;
                    }
                    page.read_bytes(slot as usize * record_size, &mut buf);
                    if !self.codec.is_in_use(&buf) {
                        ids.push(id);
                    }
                }
                ids
            })?;
            if let Some((ids, _)) = scanned {
                free.extend(ids);
            }
        }
        Ok(free)
    }

    /// One past the highest id ever allocated
    pub fn high_id(&self) -> u64 {
        self.ids.high_id()
    }

    /// Set the high id (recovery seeding)
    pub fn set_high_id(&self, high_id: u64) {
        self.ids.set_high_id(high_id);
    }

    /// Seed the high id from the highest id known to be in use
    pub fn set_highest_possible_id_in_use(&self, id: u64) {
        self.ids.set_highest_possible_id_in_use(id);
    }

    /// Flush store pages to disk, then checkpoint the id allocator
    pub fn flush(&self) -> Result<()> {
        self.file.flush()?;
        self.ids.checkpoint()
    }

    /// Flush and close the store, writing the id file a later open will
    /// trust. A store that is dropped without `close` rebuilds its id
    /// state by scanning on the next open.
    pub fn close(self) -> Result<()> {
        self.file.flush()?;
        self.ids.close()
    }

    /// Store statistics snapshot
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            high_id: self.ids.high_id(),
            ids_in_use: self.ids.ids_in_use(),
            file_size: self.file.file_size(),
            record_size: self.record_size,
        }
    }

    /// Log id usage at debug level
    pub fn log_id_usage(&self) {
        debug!(
            store = %self.path.display(),
            used = self.ids.ids_in_use(),
            high_id = self.ids.high_id(),
            "{} id usage",
            self.codec.type_descriptor()
        );
    }

    /// Record slot size in bytes
    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    /// Records per page
    pub fn records_per_page(&self) -> u32 {
        self.records_per_page
    }

    /// Number of low ids reserved for the store header
    pub fn reserved_low_ids(&self) -> u64 {
        self.reserved_low_ids
    }

    /// Store header read at open (or written at creation)
    pub fn header(&self) -> &StoreHeader {
        &self.header
    }

    /// The codec driving this store
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Path of the store file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn page_id_for_record(&self, id: u64) -> u64 {
        id / self.records_per_page as u64
    }

    fn offset_for_id(&self, id: u64) -> usize {
        (id % self.records_per_page as u64) as usize * self.record_size as usize
    }

    fn assert_valid_id(&self, id: u64) -> Result<()> {
        if id == crate::store::record::NULL_REFERENCE {
            return Err(Error::ReservedId(id));
        }
        if id > self.codec.max_id() {
            return Err(Error::IdCapacityExceeded {
                id,
                max_id: self.codec.max_id(),
            });
        }
        Ok(())
    }

    fn out_of_bounds_error(&self, id: u64, page_id: u64, offset: usize) -> Error {
        Error::underlying_storage(format!(
            "Access to record {id} went out of bounds of the page. The record size is {} bytes, \
             the access was at offset {offset} into page {page_id}, and the pages of {} have a \
             capacity of {} bytes",
            self.record_size,
            self.path.display(),
            self.file.page_size()
        ))
    }
}

fn id_file_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".id");
    PathBuf::from(name)
}

/// Lazy forward scan over the in-use records of a store
pub struct RecordScan<'a, C: RecordCodec> {
    store: &'a FixedRecordStore<C>,
    next_id: u64,
    high_id: u64,
}

impl<C: RecordCodec> Iterator for RecordScan<'_, C> {
    type Item = Result<C::Record>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next_id < self.high_id {
            let id = self.next_id;
            self.next_id += 1;
            match self.store.get_record(id, LoadMode::Check) {
                Ok(record) if record.in_use() => return Some(Ok(record)),
                Ok(_) => continue,
                Err(e) => {
                    self.next_id = self.high_id;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
