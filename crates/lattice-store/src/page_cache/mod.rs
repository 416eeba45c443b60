//! Paged access to store files with optimistic torn-read detection
//!
//! A [`PagedFile`] maps a store file into fixed-size pages (8KB by default)
//! and hands out bounds-checked page views for positioned reads and writes.
//! Readers run under an optimistic protocol: every page carries a version
//! counter that writers bump around each mutation, and [`PagedFile::read_page`]
//! re-runs the caller's decode closure until it observes a stable version.
//! Decode closures must therefore be pure functions of the bytes they see —
//! no partial decode may escape into caller-visible state.
//!
//! # Architecture
//!
//! The file is memory-mapped (`memmap2`) and grown in whole pages on demand.
//! A `RwLock` guards the mapping itself (remaps exclude all page access);
//! per-page version counters implement the retry signal. Out-of-bounds
//! accesses through a page view never touch memory outside the page — they
//! raise a sticky bounds flag the caller checks after decoding, mirroring
//! the page-accessor contract record stores are written against.

use crate::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;
use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Page size in bytes (8KB)
pub const PAGE_SIZE: usize = 8192;

/// Memory mapping together with its per-page version counters
struct Mapping {
    mmap: MmapMut,
    num_pages: u64,
    versions: Vec<AtomicU64>,
}

/// A store file divided into fixed-size pages
pub struct PagedFile {
    file: File,
    path: PathBuf,
    page_size: usize,
    mapping: RwLock<Mapping>,
}

impl PagedFile {
    /// Open (or create) a paged file.
    ///
    /// The mapped length is always a whole number of pages: a file whose
    /// length is not page-aligned was deliberately truncated and its partial
    /// tail page is completed with zero bytes. An empty or newly created
    /// file starts with a single zero page.
    pub fn open(path: &Path, page_size: usize, create: bool) -> Result<Self> {
        if page_size == 0 {
            return Err(Error::page_cache("Page size must be > 0"));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::store_not_found(format!("{}: {}", path.display(), e))
                } else {
                    Error::Io(e)
                }
            })?;

        let len = file.metadata()?.len();
        let num_pages = (len.div_ceil(page_size as u64)).max(1);
        let mapped_len = num_pages * page_size as u64;
        if mapped_len != len {
            file.set_len(mapped_len)?;
        }

        let mmap = unsafe { MmapOptions::new().len(mapped_len as usize).map_mut(&file)? };
        let mut versions = Vec::with_capacity(num_pages as usize);
        versions.resize_with(num_pages as usize, || AtomicU64::new(0));

        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
            mapping: RwLock::new(Mapping {
                mmap,
                num_pages,
                versions,
            }),
        })
    }

    /// Page size of this file in bytes
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages currently mapped
    pub fn num_pages(&self) -> u64 {
        self.mapping.read().num_pages
    }

    /// Id of the last mapped page
    pub fn last_page_id(&self) -> u64 {
        self.num_pages() - 1
    }

    /// Current file size in bytes
    pub fn file_size(&self) -> u64 {
        self.num_pages() * self.page_size as u64
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Grow the file so that `page_id` is mapped
    pub fn ensure_page(&self, page_id: u64) -> Result<()> {
        if page_id < self.mapping.read().num_pages {
            return Ok(());
        }
        let mut mapping = self.mapping.write();
        if page_id < mapping.num_pages {
            return Ok(());
        }

        // Double the mapped size so sequential writers don't remap per page.
        let new_pages = (mapping.num_pages * 2).max(page_id + 1);
        let new_len = new_pages * self.page_size as u64;
        mapping.mmap.flush()?;
        self.file.set_len(new_len)?;
        mapping.mmap = unsafe { MmapOptions::new().len(new_len as usize).map_mut(&self.file)? };
        mapping
            .versions
            .resize_with(new_pages as usize, || AtomicU64::new(0));
        mapping.num_pages = new_pages;
        Ok(())
    }

    /// Read a page through the optimistic retry protocol.
    ///
    /// `decode` is re-invoked from scratch until it runs against a stable
    /// page version. Returns `Ok(None)` if the page is beyond the end of the
    /// file ("not read"); otherwise `(value, out_of_bounds)` where the flag
    /// reports whether any access through the view fell outside the page.
    pub fn read_page<T>(
        &self,
        page_id: u64,
        mut decode: impl FnMut(&PageView<'_>) -> T,
    ) -> Result<Option<(T, bool)>> {
        let mapping = self.mapping.read();
        if page_id >= mapping.num_pages {
            return Ok(None);
        }
        let version = &mapping.versions[page_id as usize];
        let start = page_id as usize * self.page_size;
        let bytes = &mapping.mmap[start..start + self.page_size];

        loop {
            let before = version.load(Ordering::Acquire);
            if before & 1 == 1 {
                // A writer is mid-flight on this page.
                std::hint::spin_loop();
                continue;
            }
            let view = PageView {
                bytes,
                out_of_bounds: Cell::new(false),
            };
            let value = decode(&view);
            if version.load(Ordering::Acquire) == before {
                return Ok(Some((value, view.out_of_bounds.get())));
            }
            // Torn read: a write completed underneath us, decode again.
        }
    }

    /// Write to a page, bumping its version around the mutation.
    ///
    /// With `grow` the file is extended to contain the page; otherwise a page
    /// beyond the end of the file yields `Ok(None)`. Returns the closure's
    /// value and the view's out-of-bounds flag.
    pub fn write_page<T>(
        &self,
        page_id: u64,
        grow: bool,
        write: impl FnOnce(&mut PageViewMut<'_>) -> T,
    ) -> Result<Option<(T, bool)>> {
        if grow {
            self.ensure_page(page_id)?;
        }
        let mut mapping = self.mapping.write();
        if page_id >= mapping.num_pages {
            return Ok(None);
        }
        mapping.versions[page_id as usize].fetch_add(1, Ordering::AcqRel);

        let start = page_id as usize * self.page_size;
        let bytes = &mut mapping.mmap[start..start + self.page_size];
        let mut view = PageViewMut {
            bytes,
            out_of_bounds: false,
        };
        let value = write(&mut view);
        let out_of_bounds = view.out_of_bounds;

        mapping.versions[page_id as usize].fetch_add(1, Ordering::AcqRel);
        Ok(Some((value, out_of_bounds)))
    }

    /// Flush all mapped pages to disk
    pub fn flush(&self) -> Result<()> {
        self.mapping.read().mmap.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Read-only bounds-checked view of one page.
///
/// Accesses outside the page raise a sticky out-of-bounds flag and return
/// zeroes instead of touching neighbouring pages.
pub struct PageView<'a> {
    bytes: &'a [u8],
    out_of_bounds: Cell<bool>,
}

impl PageView<'_> {
    /// Usable bytes in this page
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the page holds no usable bytes
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether any access fell outside the page
    pub fn out_of_bounds(&self) -> bool {
        self.out_of_bounds.get()
    }

    /// Read one byte
    pub fn read_u8(&self, offset: usize) -> u8 {
        match self.bytes.get(offset) {
            Some(b) => *b,
            None => {
                self.out_of_bounds.set(true);
                0
            }
        }
    }

    /// Read a little-endian u32
    pub fn read_u32(&self, offset: usize) -> u32 {
        match self.bytes.get(offset..offset + 4) {
            Some(b) => u32::from_le_bytes(b.try_into().unwrap_or([0; 4])),
            None => {
                self.out_of_bounds.set(true);
                0
            }
        }
    }

    /// Read a little-endian u64
    pub fn read_u64(&self, offset: usize) -> u64 {
        match self.bytes.get(offset..offset + 8) {
            Some(b) => u64::from_le_bytes(b.try_into().unwrap_or([0; 8])),
            None => {
                self.out_of_bounds.set(true);
                0
            }
        }
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        match self.bytes.get(offset..offset + buf.len()) {
            Some(b) => buf.copy_from_slice(b),
            None => {
                self.out_of_bounds.set(true);
                buf.fill(0);
            }
        }
    }
}

/// Mutable bounds-checked view of one page
pub struct PageViewMut<'a> {
    bytes: &'a mut [u8],
    out_of_bounds: bool,
}

impl PageViewMut<'_> {
    /// Usable bytes in this page
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the page holds no usable bytes
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether any access fell outside the page
    pub fn out_of_bounds(&self) -> bool {
        self.out_of_bounds
    }

    /// Write one byte
    pub fn write_u8(&mut self, offset: usize, value: u8) {
        match self.bytes.get_mut(offset) {
            Some(b) => *b = value,
            None => self.out_of_bounds = true,
        }
    }

    /// Write a little-endian u32
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        match self.bytes.get_mut(offset..offset + 4) {
            Some(b) => b.copy_from_slice(&value.to_le_bytes()),
            None => self.out_of_bounds = true,
        }
    }

    /// Write a little-endian u64
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        match self.bytes.get_mut(offset..offset + 8) {
            Some(b) => b.copy_from_slice(&value.to_le_bytes()),
            None => self.out_of_bounds = true,
        }
    }

    /// Write all of `data` starting at `offset`
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) {
        match self.bytes.get_mut(offset..offset + data.len()) {
            Some(b) => b.copy_from_slice(data),
            None => self.out_of_bounds = true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_file(dir: &TempDir, page_size: usize) -> PagedFile {
        PagedFile::open(&dir.path().join("test.store"), page_size, true).unwrap()
    }

    #[test]
    fn test_new_file_has_one_page() {
        let dir = TempDir::new().unwrap();
        let file = open_file(&dir, 512);
        assert_eq!(file.num_pages(), 1);
        assert_eq!(file.file_size(), 512);
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let dir = TempDir::new().unwrap();
        let result = PagedFile::open(&dir.path().join("test.store"), 0, true);
        assert!(matches!(result, Err(Error::PageCache(_))));
    }

    #[test]
    fn test_missing_file_without_create() {
        let dir = TempDir::new().unwrap();
        let result = PagedFile::open(&dir.path().join("absent.store"), 512, false);
        assert!(matches!(result, Err(Error::StoreNotFound(_))));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let file = open_file(&dir, 512);

        file.write_page(0, false, |page| {
            page.write_u64(16, 0xDEAD_BEEF);
            page.write_u8(0, 7);
        })
        .unwrap();

        let ((value, byte), oob) = file
            .read_page(0, |page| (page.read_u64(16), page.read_u8(0)))
            .unwrap()
            .unwrap();
        assert!(!oob);
        assert_eq!(value, 0xDEAD_BEEF);
        assert_eq!(byte, 7);
    }

    #[test]
    fn test_read_beyond_file_is_not_read() {
        let dir = TempDir::new().unwrap();
        let file = open_file(&dir, 512);
        let result = file.read_page(10, |page| page.read_u8(0)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_out_of_bounds_flag() {
        let dir = TempDir::new().unwrap();
        let file = open_file(&dir, 64);

        let (_, oob) = file.read_page(0, |page| page.read_u64(60)).unwrap().unwrap();
        assert!(oob);

        let (_, oob) = file
            .write_page(0, false, |page| page.write_u32(62, 1))
            .unwrap()
            .unwrap();
        assert!(oob);

        // An in-bounds access does not raise the flag.
        let (_, oob) = file.read_page(0, |page| page.read_u32(60)).unwrap().unwrap();
        assert!(!oob);
    }

    #[test]
    fn test_growth() {
        let dir = TempDir::new().unwrap();
        let file = open_file(&dir, 256);

        file.write_page(9, true, |page| page.write_u8(0, 42)).unwrap();
        assert!(file.num_pages() >= 10);

        let ((byte, _), _) = file
            .read_page(9, |page| (page.read_u8(0), ()))
            .unwrap()
            .unwrap();
        assert_eq!(byte, 42);
    }

    #[test]
    fn test_write_beyond_without_grow() {
        let dir = TempDir::new().unwrap();
        let file = open_file(&dir, 256);
        let result = file.write_page(5, false, |page| page.write_u8(0, 1)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_truncated_tail_page_is_completed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.store");
        std::fs::write(&path, vec![0xAAu8; 700]).unwrap();

        let file = PagedFile::open(&path, 512, false).unwrap();
        assert_eq!(file.num_pages(), 2);

        // The partial tail was zero-extended, the original bytes survive.
        let ((head, tail), _) = file
            .read_page(1, |page| (page.read_u8(0), page.read_u8(300)))
            .unwrap()
            .unwrap();
        assert_eq!(head, 0xAA);
        assert_eq!(tail, 0);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.store");
        {
            let file = PagedFile::open(&path, 512, true).unwrap();
            file.write_page(3, true, |page| page.write_u64(8, 999)).unwrap();
            file.flush().unwrap();
        }
        {
            let file = PagedFile::open(&path, 512, false).unwrap();
            let ((value, _), _) = file
                .read_page(3, |page| (page.read_u64(8), ()))
                .unwrap()
                .unwrap();
            assert_eq!(value, 999);
        }
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        use std::sync::Arc;
        use std::thread;

        let dir = TempDir::new().unwrap();
        let file = Arc::new(open_file(&dir, 512));
        file.ensure_page(7).unwrap();

        let mut handles = vec![];
        for t in 0..4u64 {
            let f = Arc::clone(&file);
            handles.push(thread::spawn(move || {
                for i in 0..200u64 {
                    f.write_page(t, false, |page| {
                        // Two related fields a torn reader could see half-updated.
                        page.write_u64(0, i);
                        page.write_u64(8, i * 2);
                    })
                    .unwrap();
                }
            }));
        }
        for t in 0..4u64 {
            let f = Arc::clone(&file);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let ((a, b), _) = f
                        .read_page(t, |page| (page.read_u64(0), page.read_u64(8)))
                        .unwrap()
                        .unwrap();
                    assert_eq!(b, a * 2, "observed a torn record");
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
