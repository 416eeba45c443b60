//! Identifier allocation and recycling
//!
//! Each record store owns one [`IdAllocator`] for its id space: new ids come
//! from a monotonically growing high id, deleted ids are recycled through a
//! free list, and all used/deleted marks flow through a scoped [`IdMarker`]
//! whose release is the boundary after which freed ids become eligible for
//! reuse. The allocator persists to a small sidecar file (`<store>.id`)
//! that is only trusted when written by a clean close — the file is stamped
//! dirty as soon as it is loaded, so a crash at any point forces a rebuild
//! from the owning store's scan. That rebuild is the crash-recovery
//! contract: allocator corruption is never fatal for the store.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic tag identifying an id file
pub const ID_FILE_MAGIC: u32 = 0x4C49_4446;

/// Id file format version
pub const ID_FILE_VERSION: u32 = 1;

const STICKY_CLEAN: u8 = 1;
const STICKY_DIRTY: u8 = 0;

/// Fixed-size prefix: magic, version, sticky, high id, free count
const ID_FILE_HEADER_SIZE: usize = 4 + 4 + 1 + 8 + 8;

struct AllocState {
    high_id: u64,
    free: BTreeSet<u64>,
    needs_rebuild: bool,
}

/// Owns the record id space of one store: hands out new ids, recycles
/// freed ids, and rebuilds itself from a store scan when its persisted
/// state is missing or untrustworthy.
pub struct IdAllocator {
    path: PathBuf,
    first_id: u64,
    max_id: u64,
    state: Mutex<AllocState>,
}

impl IdAllocator {
    /// Create a fresh allocator for a newly created store.
    ///
    /// `first_id` is the lowest allocatable id (slots below it are reserved
    /// for the store header); `max_id` is the highest id the record format
    /// can address.
    pub fn create(path: &Path, first_id: u64, max_id: u64) -> Result<Self> {
        let allocator = Self {
            path: path.to_path_buf(),
            first_id,
            max_id,
            state: Mutex::new(AllocState {
                high_id: first_id,
                free: BTreeSet::new(),
                needs_rebuild: false,
            }),
        };
        allocator.write_state(STICKY_DIRTY)?;
        Ok(allocator)
    }

    /// Open the allocator for an existing store.
    ///
    /// Loads the persisted state when the id file is present, checksummed
    /// and was written by a clean close; any other state (missing file,
    /// short file, bad crc, dirty sticky byte) leaves the allocator in the
    /// needs-rebuild state for the owning store to repopulate via
    /// [`IdAllocator::rebuild`]. A successfully loaded file is immediately
    /// stamped dirty again.
    pub fn open(path: &Path, first_id: u64, max_id: u64) -> Result<Self> {
        let state = match Self::load_state(path) {
            Some((high_id, free)) => {
                debug!(path = %path.display(), high_id, "loaded id file");
                AllocState {
                    high_id: high_id.max(first_id),
                    free,
                    needs_rebuild: false,
                }
            }
            None => {
                warn!(path = %path.display(), "id file missing or not trustworthy, rebuild required");
                AllocState {
                    high_id: first_id,
                    free: BTreeSet::new(),
                    needs_rebuild: true,
                }
            }
        };
        let allocator = Self {
            path: path.to_path_buf(),
            first_id,
            max_id,
            state: Mutex::new(state),
        };
        if !allocator.needs_rebuild() {
            allocator.write_state(STICKY_DIRTY)?;
        }
        Ok(allocator)
    }

    fn load_state(path: &Path) -> Option<(u64, BTreeSet<u64>)> {
        let bytes = std::fs::read(path).ok()?;
        if bytes.len() < ID_FILE_HEADER_SIZE + 4 {
            return None;
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let version = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
        if magic != ID_FILE_MAGIC || version != ID_FILE_VERSION {
            return None;
        }
        if bytes[8] != STICKY_CLEAN {
            return None;
        }
        let high_id = u64::from_le_bytes(bytes[9..17].try_into().ok()?);
        let free_count = u64::from_le_bytes(bytes[17..25].try_into().ok()?) as usize;
        let body_end = ID_FILE_HEADER_SIZE + free_count * 8;
        if bytes.len() != body_end + 4 {
            return None;
        }
        let stored_crc = u32::from_le_bytes(bytes[body_end..body_end + 4].try_into().ok()?);
        if crc32fast::hash(&bytes[8..body_end]) != stored_crc {
            return None;
        }
        let mut free = BTreeSet::new();
        for i in 0..free_count {
            let start = ID_FILE_HEADER_SIZE + i * 8;
            free.insert(u64::from_le_bytes(bytes[start..start + 8].try_into().ok()?));
        }
        Some((high_id, free))
    }

    fn write_state(&self, sticky: u8) -> Result<()> {
        let state = self.state.lock();
        let mut bytes = Vec::with_capacity(ID_FILE_HEADER_SIZE + state.free.len() * 8 + 4);
        bytes.extend_from_slice(&ID_FILE_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&ID_FILE_VERSION.to_le_bytes());
        bytes.push(sticky);
        bytes.extend_from_slice(&state.high_id.to_le_bytes());
        bytes.extend_from_slice(&(state.free.len() as u64).to_le_bytes());
        for id in &state.free {
            bytes.extend_from_slice(&id.to_le_bytes());
        }
        let crc = crc32fast::hash(&bytes[8..]);
        bytes.extend_from_slice(&crc.to_le_bytes());
        drop(state);

        let mut file = File::create(&self.path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }

    /// Whether the allocator is waiting for [`IdAllocator::rebuild`]
    pub fn needs_rebuild(&self) -> bool {
        self.state.lock().needs_rebuild
    }

    /// Repopulate the allocator from the owning store's scan: the recovered
    /// high id and every id below it that is not in use.
    pub fn rebuild(&self, high_id: u64, free_ids: impl IntoIterator<Item = u64>) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.high_id = high_id.max(self.first_id);
            state.free = free_ids.into_iter().collect();
            state.needs_rebuild = false;
        }
        self.write_state(STICKY_DIRTY)
    }

    /// Next free id: a recycled id if one is eligible, else `high_id`,
    /// which then grows by one.
    pub fn next_id(&self) -> Result<u64> {
        let mut state = self.state.lock();
        if state.needs_rebuild {
            return Err(Error::storage(format!(
                "Id allocator {} used before rebuild",
                self.path.display()
            )));
        }
        if let Some(id) = state.free.pop_first() {
            return Ok(id);
        }
        let id = state.high_id;
        if id > self.max_id {
            return Err(Error::IdCapacityExceeded {
                id,
                max_id: self.max_id,
            });
        }
        state.high_id += 1;
        Ok(id)
    }

    /// Scoped write handle for marking ids used/deleted as part of the same
    /// durability unit as the record write that caused the change. Marks are
    /// buffered and applied when the marker is dropped; only then do freed
    /// ids become eligible for reuse.
    pub fn marker(&self) -> IdMarker<'_> {
        IdMarker {
            allocator: self,
            used: Vec::new(),
            deleted: Vec::new(),
        }
    }

    fn apply_marks(&self, used: &[u64], deleted: &[u64]) {
        let mut state = self.state.lock();
        for &id in used {
            state.free.remove(&id);
            if id >= state.high_id {
                state.high_id = id + 1;
            }
        }
        for &id in deleted {
            if id >= self.first_id && id < state.high_id {
                state.free.insert(id);
            }
        }
    }

    /// One past the highest id ever allocated
    pub fn high_id(&self) -> u64 {
        self.state.lock().high_id
    }

    /// Set the high id unconditionally (recovery seeding)
    pub fn set_high_id(&self, high_id: u64) {
        let mut state = self.state.lock();
        state.high_id = high_id.max(self.first_id);
        state.free.retain(|&id| id < high_id);
    }

    /// Seed the high id from the highest id known to be in use
    pub fn set_highest_possible_id_in_use(&self, id: u64) {
        self.set_high_id(id + 1);
    }

    /// Number of ids currently in use (allocated and not freed)
    pub fn ids_in_use(&self) -> u64 {
        let state = self.state.lock();
        state.high_id - self.first_id - state.free.len() as u64
    }

    /// Persist the current state, keeping the dirty sticky byte.
    ///
    /// An unclean shutdown after a checkpoint still rebuilds from the store
    /// scan; only [`IdAllocator::close`] writes a file that a later open
    /// will trust.
    pub fn checkpoint(&self) -> Result<()> {
        self.write_state(STICKY_DIRTY)
    }

    /// Persist the final state with the clean sticky byte. Must only be
    /// called once all record writes to the owning store have ceased.
    pub fn close(&self) -> Result<()> {
        self.write_state(STICKY_CLEAN)
    }
}

/// Scoped batch of id marks; applied to the allocator on drop.
pub struct IdMarker<'a> {
    allocator: &'a IdAllocator,
    used: Vec<u64>,
    deleted: Vec<u64>,
}

impl IdMarker<'_> {
    /// Mark an id as used (removes it from the free list, bumps high id)
    pub fn mark_used(&mut self, id: u64) {
        self.used.push(id);
    }

    /// Mark an id as deleted; it becomes eligible for reuse when this
    /// marker is released
    pub fn mark_deleted(&mut self, id: u64) {
        self.deleted.push(id);
    }
}

impl Drop for IdMarker<'_> {
    fn drop(&mut self) {
        self.allocator.apply_marks(&self.used, &self.deleted);
    }
}
