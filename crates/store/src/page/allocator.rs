//! Free-pool page allocator.
//!
//! All pages are the same size and only the single writer allocates, so a
//! plain stack of reusable page numbers plus a high-water mark is enough.
//! Pages enter the pool only once no snapshot can reach them; the deferral
//! itself lives in [`PendingFrees`](crate::transaction::PendingFrees).

use parking_lot::Mutex;

use crate::{
    backend::FIRST_DATA_PAGE,
    error::{Error, PageId, Result},
};

/// Free-pool based page allocator.
///
/// Pages are allocated from the pool of reusable pages. When the pool is
/// empty, new pages are allocated past the end of the file.
pub struct PageAllocator {
    /// Pages available for immediate reuse.
    free_pages: Mutex<Vec<PageId>>,
    /// Next page ID to allocate if the pool is empty.
    next_page: Mutex<PageId>,
    /// Page size in bytes.
    page_size: usize,
    /// Upper bound on `next_page`, if any.
    max_pages: Option<u64>,
}

impl PageAllocator {
    /// Creates a new allocator.
    pub fn new(page_size: usize, initial_next_page: PageId, max_pages: Option<u64>) -> Self {
        Self {
            free_pages: Mutex::new(Vec::new()),
            next_page: Mutex::new(initial_next_page.max(FIRST_DATA_PAGE)),
            page_size,
            max_pages,
        }
    }

    /// Allocates a page number, preferring reusable pages over growing the file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageExhausted`] if the pool is empty and the file
    /// already holds `max_pages` pages.
    pub fn allocate(&self) -> Result<PageId> {
        if let Some(page_id) = self.free_pages.lock().pop() {
            return Ok(page_id);
        }

        let mut next = self.next_page.lock();
        if let Some(limit) = self.max_pages {
            if *next >= limit {
                return Err(Error::StorageExhausted { limit });
            }
        }
        let page_id = *next;
        *next += 1;
        Ok(page_id)
    }

    /// Returns a page to the reusable pool.
    pub fn free(&self, page_id: PageId) {
        self.free_pages.lock().push(page_id);
    }

    /// Returns multiple pages to the reusable pool.
    pub fn free_batch(&self, page_ids: &[PageId]) {
        self.free_pages.lock().extend_from_slice(page_ids);
    }

    /// Returns the next page ID that would be allocated past the end of the file.
    pub fn next_page_id(&self) -> PageId {
        *self.next_page.lock()
    }

    /// Returns the number of pages in the reusable pool.
    pub fn free_page_count(&self) -> usize {
        self.free_pages.lock().len()
    }

    /// Replaces the allocator state (used on open and after compaction).
    pub fn reset(&self, next_page: PageId, free_pages: Vec<PageId>) {
        *self.free_pages.lock() = free_pages;
        *self.next_page.lock() = next_page.max(FIRST_DATA_PAGE);
    }

    /// Returns a copy of the reusable pool.
    pub fn get_free_list(&self) -> Vec<PageId> {
        self.free_pages.lock().clone()
    }

    /// Returns page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Calculates the file size in bytes needed for the current high-water mark.
    pub fn required_file_size(&self) -> u64 {
        self.next_page_id() * self.page_size as u64
    }
}
