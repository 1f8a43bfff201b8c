//! In-memory storage backend for testing.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{
    DEFAULT_PAGE_SIZE, META_SLOT_SIZE, META_SLOTS, MetaSlot, StorageBackend, validate_page_size,
};
use crate::{
    error::{Error, PageId, Result},
    types::KeyOrder,
};

/// In-memory storage backend for testing.
///
/// All data is stored in memory and lost when the backend is dropped.
/// This is useful for unit tests and benchmarking.
pub struct InMemoryBackend {
    /// The two meta slots.
    meta: RwLock<[Vec<u8>; META_SLOTS]>,
    /// Pages indexed by page ID.
    pages: RwLock<HashMap<PageId, Vec<u8>>>,
    /// Page size in bytes.
    page_size: usize,
    /// Simulated file size.
    file_size: RwLock<u64>,
}

impl InMemoryBackend {
    /// Creates a new in-memory backend with default page size.
    pub fn new() -> Self {
        Self::initialized(DEFAULT_PAGE_SIZE)
    }

    /// Creates a new in-memory backend with the given page size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the page size is unsupported.
    pub fn with_page_size(page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        Ok(Self::initialized(page_size))
    }

    fn initialized(page_size: usize) -> Self {
        let backend = Self::blank(page_size);
        let initial = MetaSlot::new(page_size, KeyOrder::Forward).to_bytes().to_vec();
        *backend.meta.write() = [initial.clone(), initial];
        backend
    }

    fn blank(page_size: usize) -> Self {
        Self {
            meta: RwLock::new([vec![0u8; META_SLOT_SIZE], vec![0u8; META_SLOT_SIZE]]),
            pages: RwLock::new(HashMap::new()),
            page_size,
            file_size: RwLock::new(page_size as u64),
        }
    }

    /// Returns the number of pages currently stored.
    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_meta(&self, slot: usize) -> Result<Vec<u8>> {
        self.meta
            .read()
            .get(slot)
            .cloned()
            .ok_or_else(|| Error::Corrupted { reason: format!("Invalid meta slot index {slot}") })
    }

    fn write_meta(&self, slot: usize, data: &[u8]) -> Result<()> {
        if data.len() != META_SLOT_SIZE {
            return Err(Error::Corrupted {
                reason: format!(
                    "Invalid meta slot size: {} (expected {META_SLOT_SIZE})",
                    data.len()
                ),
            });
        }
        let mut meta = self.meta.write();
        let target = meta
            .get_mut(slot)
            .ok_or_else(|| Error::Corrupted { reason: format!("Invalid meta slot index {slot}") })?;
        *target = data.to_vec();
        Ok(())
    }

    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>> {
        let pages = self.pages.read();
        match pages.get(&page_id) {
            Some(data) => Ok(data.clone()),
            None => Ok(vec![0u8; self.page_size]),
        }
    }

    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(Error::Corrupted {
                reason: format!(
                    "Invalid page data size: {} (expected {})",
                    data.len(),
                    self.page_size
                ),
            });
        }
        if page_id == 0 {
            return Err(Error::Corrupted { reason: "Page 0 is reserved for meta slots".into() });
        }

        self.pages.write().insert(page_id, data.to_vec());

        let required_size = self.page_offset(page_id) + self.page_size as u64;
        let mut file_size = self.file_size.write();
        if *file_size < required_size {
            *file_size = required_size;
        }

        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(*self.file_size.read())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn create_compaction_target(&self) -> Result<Self> {
        Ok(Self::blank(self.page_size))
    }

    fn install_compacted(&mut self, target: Self) -> Result<()> {
        *self = target;
        Ok(())
    }
}
