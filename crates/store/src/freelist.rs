//! Persisted free list.
//!
//! At commit the engine writes every page number that is free or waiting
//! for readers into a chain of free-list pages and records the chain's
//! head in the meta slot. Each entry carries the transaction that vacated
//! the page (0 for pages that were already reusable).
//!
//! ```text
//! Offset  Size      Field
//! 0       24        Page header (type FreeList)
//! 24      8         Next free-list page (0 = last)
//! 32      4         Number of entries in this page
//! 36      4         Reserved
//! 40      16 * n    Entries: page number (u64), vacating transaction (u64)
//! ```
//!
//! On open there are no readers, so every listed page is immediately
//! reusable.

use std::collections::HashSet;

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    backend::FIRST_DATA_PAGE,
    btree::PageSource,
    error::{Error, PageId, PageType, Result},
    page::{PAGE_HEADER_SIZE, Page},
};

const NEXT_OFFSET: usize = PAGE_HEADER_SIZE;
const COUNT_OFFSET: usize = PAGE_HEADER_SIZE + 8;
const ENTRIES_START: usize = PAGE_HEADER_SIZE + 16;
const ENTRY_SIZE: usize = 16;

/// A free page and the transaction that vacated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeEntry {
    /// The free page.
    pub page_id: PageId,
    /// Transaction that vacated it, 0 if it was already reusable.
    pub freed_by: u64,
}

/// Entries that fit in one free-list page.
pub fn entries_per_page(page_size: usize) -> usize {
    (page_size - ENTRIES_START) / ENTRY_SIZE
}

/// Pages needed to hold `entries` entries.
pub fn pages_needed(entries: usize, page_size: usize) -> usize {
    entries.div_ceil(entries_per_page(page_size))
}

/// Builds the chain for `entries` on the pages `page_ids`.
///
/// `page_ids` must hold at least [`pages_needed`] pages; the first one is the
/// head of the chain. Surplus pages are chained in with no entries, which
/// happens when taking the chain's own pages out of the pool shrank the list.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if there are too few pages for the entries.
pub fn build_chain(
    page_ids: &[PageId],
    entries: &[FreeEntry],
    page_size: usize,
    txn_id: u64,
) -> Result<Vec<Page>> {
    if page_ids.len() < pages_needed(entries.len(), page_size) {
        return Err(Error::Corrupted {
            reason: format!(
                "Free list of {} entries given {} pages",
                entries.len(),
                page_ids.len()
            ),
        });
    }

    let mut chunks = entries.chunks(entries_per_page(page_size));
    let mut pages = Vec::with_capacity(page_ids.len());
    for (i, &page_id) in page_ids.iter().enumerate() {
        let chunk = chunks.next().unwrap_or(&[]);
        let mut page = Page::new(page_id, page_size, PageType::FreeList, txn_id);
        let next = page_ids.get(i + 1).copied().unwrap_or(0);
        LittleEndian::write_u64(&mut page.data[NEXT_OFFSET..NEXT_OFFSET + 8], next);
        LittleEndian::write_u32(&mut page.data[COUNT_OFFSET..COUNT_OFFSET + 4], chunk.len() as u32);
        for (j, entry) in chunk.iter().enumerate() {
            let at = ENTRIES_START + j * ENTRY_SIZE;
            LittleEndian::write_u64(&mut page.data[at..at + 8], entry.page_id);
            LittleEndian::write_u64(&mut page.data[at + 8..at + 16], entry.freed_by);
        }
        page.seal(txn_id);
        pages.push(page);
    }
    Ok(pages)
}

/// A free list read back from disk.
#[derive(Debug, Default)]
pub struct LoadedFreeList {
    /// Pages making up the chain itself.
    pub chain: Vec<PageId>,
    /// Free pages listed in the chain.
    pub entries: Vec<FreeEntry>,
}

/// Reads the chain starting at `head`.
///
/// Every listed page must lie in `FIRST_DATA_PAGE..total_pages` and appear
/// only once, and the chain may not list its own pages.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] for a malformed chain, or any read error.
pub fn read_chain<S: PageSource + ?Sized>(
    source: &S,
    head: PageId,
    total_pages: PageId,
) -> Result<LoadedFreeList> {
    let mut loaded = LoadedFreeList::default();
    let mut seen = HashSet::new();
    let per_page = entries_per_page(source.page_size());
    let in_range = |page_id: PageId| (FIRST_DATA_PAGE..total_pages).contains(&page_id);

    let mut next = head;
    while next != 0 {
        if !in_range(next) || !seen.insert(next) {
            return Err(Error::Corrupted {
                reason: format!("Free list page {next} is out of range or repeated"),
            });
        }
        let page = source.read_page(next)?;
        page.expect_type(PageType::FreeList)?;

        let count = LittleEndian::read_u32(&page.data[COUNT_OFFSET..COUNT_OFFSET + 4]) as usize;
        if count > per_page {
            return Err(Error::Corrupted {
                reason: format!("Free list page {next} claims {count} entries"),
            });
        }
        for j in 0..count {
            let at = ENTRIES_START + j * ENTRY_SIZE;
            let entry = FreeEntry {
                page_id: LittleEndian::read_u64(&page.data[at..at + 8]),
                freed_by: LittleEndian::read_u64(&page.data[at + 8..at + 16]),
            };
            if !in_range(entry.page_id) || !seen.insert(entry.page_id) {
                return Err(Error::Corrupted {
                    reason: format!(
                        "Free list page {next} lists page {} twice or out of range",
                        entry.page_id
                    ),
                });
            }
            loaded.entries.push(entry);
        }
        loaded.chain.push(next);
        next = LittleEndian::read_u64(&page.data[NEXT_OFFSET..NEXT_OFFSET + 8]);
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{PageProvider, test_support::TestPageProvider};

    fn entries(n: u64) -> Vec<FreeEntry> {
        (0..n).map(|i| FreeEntry { page_id: 100 + i, freed_by: i % 3 }).collect()
    }

    fn store(provider: &mut TestPageProvider, ids: &[PageId], entries: &[FreeEntry]) {
        for page in build_chain(ids, entries, provider.page_size(), 1).unwrap() {
            provider.write_page(page).unwrap();
        }
    }

    #[test]
    fn test_capacity() {
        assert_eq!(entries_per_page(4096), 253);
        assert_eq!(pages_needed(0, 4096), 0);
        assert_eq!(pages_needed(253, 4096), 1);
        assert_eq!(pages_needed(254, 4096), 2);
    }

    #[test]
    fn test_chain_round_trip() {
        let mut provider = TestPageProvider::new();
        let listed = entries(600);
        store(&mut provider, &[1, 2, 3], &listed);

        let loaded = read_chain(&provider, 1, 1000).unwrap();
        assert_eq!(loaded.chain, vec![1, 2, 3]);
        assert_eq!(loaded.entries, listed);
    }

    #[test]
    fn test_empty_chain() {
        let provider = TestPageProvider::new();
        let loaded = read_chain(&provider, 0, 10).unwrap();
        assert!(loaded.chain.is_empty());
        assert!(loaded.entries.is_empty());
    }

    #[test]
    fn test_too_few_pages_rejected() {
        assert!(matches!(build_chain(&[1], &entries(300), 4096, 1), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_surplus_pages_stay_empty() {
        let mut provider = TestPageProvider::new();
        let listed = entries(10);
        store(&mut provider, &[4, 5], &listed);

        let loaded = read_chain(&provider, 4, 1000).unwrap();
        assert_eq!(loaded.chain, vec![4, 5]);
        assert_eq!(loaded.entries, listed);
    }

    #[test]
    fn test_out_of_range_entry_is_corruption() {
        let mut provider = TestPageProvider::new();
        store(&mut provider, &[1], &entries(5));
        assert!(matches!(read_chain(&provider, 1, 102), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_chain_listing_itself_is_corruption() {
        let mut provider = TestPageProvider::new();
        store(&mut provider, &[1], &[FreeEntry { page_id: 1, freed_by: 0 }]);
        assert!(matches!(read_chain(&provider, 1, 10), Err(Error::Corrupted { .. })));
    }
}
