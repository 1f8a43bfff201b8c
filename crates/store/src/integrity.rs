//! Integrity scrubber for detecting silent data corruption.
//!
//! Walks a committed snapshot straight from the backend, bypassing the page
//! cache, and checks what is actually on disk:
//!
//! - page checksums and header page numbers
//! - key order within leaves, and keys against their parent's separators
//! - every leaf at the same depth
//! - overflow chains: page types, chain length, terminating link
//! - no page referenced twice, and no reachable page on the free list

use std::{cmp::Ordering, collections::HashSet};

use crate::{
    backend::{FIRST_DATA_PAGE, StorageBackend},
    btree::{
        MAX_DEPTH,
        node::{BranchNodeRef, LeafNodeRef, LeafValue},
        overflow::{next_page, pages_for},
    },
    db::Database,
    error::{Error, PageId, PageType, Result},
    page::Page,
    types::KeyOrder,
};

/// Result of an integrity scrub.
#[derive(Debug, Clone, Default)]
pub struct ScrubResult {
    /// Number of pages checked.
    pub pages_checked: u64,
    /// Number of key/value pairs checked.
    pub entries_checked: u64,
    /// Number of checksum or unreadable-page errors.
    pub checksum_errors: u64,
    /// Number of structural errors (ordering, depth, references).
    pub structural_errors: u64,
    /// Detailed error descriptions.
    pub errors: Vec<ScrubError>,
}

impl ScrubResult {
    /// Whether the scrub found nothing wrong.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn checksum(&mut self, page_id: PageId, description: String) {
        self.checksum_errors += 1;
        self.errors.push(ScrubError { page_id, description });
    }

    fn structural(&mut self, page_id: PageId, description: String) {
        self.structural_errors += 1;
        self.errors.push(ScrubError { page_id, description });
    }
}

/// A single integrity error detected during scrubbing.
#[derive(Debug, Clone)]
pub struct ScrubError {
    /// The page where the error was detected.
    pub page_id: PageId,
    /// Human-readable description of the error.
    pub description: String,
}

/// Key range a subtree must stay within: `lower <= key < upper` in
/// comparator order.
#[derive(Clone, Copy)]
struct Bounds<'k> {
    lower: Option<&'k [u8]>,
    upper: Option<&'k [u8]>,
}

impl Bounds<'_> {
    fn contains(&self, key: &[u8], order: KeyOrder) -> bool {
        let above = self.lower.is_none_or(|lower| order.compare(key, lower) != Ordering::Less);
        let below = self.upper.is_none_or(|upper| order.compare(key, upper) == Ordering::Less);
        above && below
    }
}

/// Integrity scrubber for a database.
pub struct IntegrityScrubber<'a, B: StorageBackend> {
    db: &'a Database<B>,
}

impl<'a, B: StorageBackend> IntegrityScrubber<'a, B> {
    /// Creates a scrubber for the given database.
    pub fn new(db: &'a Database<B>) -> Self {
        Self { db }
    }

    fn read_raw(&self, page_id: PageId) -> Result<Page> {
        if page_id < FIRST_DATA_PAGE {
            return Err(Error::PageNotFound { page_id });
        }
        let data = self.db.backend.read().read_page(page_id)?;
        let page = Page::from_bytes(page_id, data);
        page.verify()?;
        Ok(page)
    }

    /// Verifies checksums for the given pages, skipping free ones.
    pub fn verify_page_checksums(&self, page_ids: &[PageId]) -> ScrubResult {
        let free: HashSet<PageId> = self.db.allocator.get_free_list().into_iter().collect();
        let total_pages = self.db.allocator.next_page_id();
        let mut result = ScrubResult::default();

        for &page_id in page_ids {
            if free.contains(&page_id) || page_id >= total_pages {
                continue;
            }
            result.pages_checked += 1;
            match self.read_raw(page_id) {
                Ok(_) | Err(Error::PageNotFound { .. }) => {},
                Err(err) => result.checksum(page_id, format!("Page {page_id}: {err}")),
            }
        }
        result
    }

    /// Verifies the tree under `root` and that none of its pages is free.
    pub fn verify_tree(&self, root: PageId, order: KeyOrder) -> ScrubResult {
        let mut walk = TreeWalk {
            scrubber: self,
            order,
            result: ScrubResult::default(),
            seen: HashSet::new(),
            leaf_depth: None,
        };
        if root != 0 {
            walk.visit(root, Bounds { lower: None, upper: None }, 1);
        }

        let mut result = walk.result;
        let pending: Vec<PageId> =
            self.db.pending_frees.lock().entries().into_iter().map(|(_, page_id)| page_id).collect();
        let mut listed = HashSet::new();
        for page_id in self.db.allocator.get_free_list().into_iter().chain(pending) {
            if !listed.insert(page_id) {
                result.structural(page_id, format!("Page {page_id} is on the free list twice"));
            }
            if walk.seen.contains(&page_id) {
                result.structural(page_id, format!("Page {page_id} is both free and reachable"));
            }
        }
        result
    }
}

struct TreeWalk<'s, 'a, B: StorageBackend> {
    scrubber: &'s IntegrityScrubber<'a, B>,
    order: KeyOrder,
    result: ScrubResult,
    seen: HashSet<PageId>,
    leaf_depth: Option<usize>,
}

impl<B: StorageBackend> TreeWalk<'_, '_, B> {
    /// Marks a page as referenced. Returns false if it already was.
    fn claim(&mut self, page_id: PageId) -> bool {
        if self.seen.insert(page_id) {
            return true;
        }
        self.result.structural(page_id, format!("Page {page_id} is referenced twice"));
        false
    }

    fn visit(&mut self, page_id: PageId, bounds: Bounds<'_>, depth: usize) {
        if depth > MAX_DEPTH {
            self.result.structural(page_id, format!("Tree deeper than {MAX_DEPTH} levels"));
            return;
        }
        if !self.claim(page_id) {
            return;
        }
        let page = match self.scrubber.read_raw(page_id) {
            Ok(page) => page,
            Err(err) => {
                self.result.checksum(page_id, format!("Cannot read tree page {page_id}: {err}"));
                return;
            },
        };
        self.result.pages_checked += 1;

        match page.page_type() {
            Ok(PageType::BTreeLeaf) => self.visit_leaf(&page, bounds, depth),
            Ok(PageType::BTreeBranch) => self.visit_branch(&page, bounds, depth),
            Ok(other) => {
                self.result.structural(page_id, format!("Unexpected {other:?} page in the tree"));
            },
            Err(err) => {
                self.result.structural(page_id, format!("Invalid header on page {page_id}: {err}"));
            },
        }
    }

    fn visit_leaf(&mut self, page: &Page, bounds: Bounds<'_>, depth: usize) {
        let leaf = match LeafNodeRef::from_page(page) {
            Ok(leaf) => leaf,
            Err(err) => {
                self.result.structural(page.id, format!("Cannot parse leaf {}: {err}", page.id));
                return;
            },
        };

        match self.leaf_depth {
            None => self.leaf_depth = Some(depth),
            Some(expected) if expected != depth => self.result.structural(
                page.id,
                format!("Leaf {} at depth {depth}, expected {expected}", page.id),
            ),
            Some(_) => {},
        }

        let mut ordered = true;
        let mut in_bounds = true;
        for idx in 0..leaf.cell_count() {
            let key = leaf.key(idx);
            if idx > 0 && self.order.compare(leaf.key(idx - 1), key) != Ordering::Less {
                ordered = false;
            }
            if !bounds.contains(key, self.order) {
                in_bounds = false;
            }
            if let LeafValue::Overflow { head, len } = leaf.value(idx) {
                self.visit_overflow(head, len as usize);
            }
            self.result.entries_checked += 1;
        }

        if !ordered {
            self.result.structural(page.id, format!("Keys out of order in leaf {}", page.id));
        }
        if !in_bounds {
            self.result.structural(
                page.id,
                format!("Leaf {} holds keys outside its parent's separators", page.id),
            );
        }
    }

    fn visit_branch(&mut self, page: &Page, bounds: Bounds<'_>, depth: usize) {
        let branch = match BranchNodeRef::from_page(page) {
            Ok(branch) => branch,
            Err(err) => {
                self.result.structural(page.id, format!("Cannot parse branch {}: {err}", page.id));
                return;
            },
        };

        let count = branch.cell_count();
        for idx in 0..count {
            let key = branch.key(idx);
            if idx > 0 && self.order.compare(branch.key(idx - 1), key) != Ordering::Less {
                self.result
                    .structural(page.id, format!("Separators out of order in branch {}", page.id));
                break;
            }
            if !bounds.contains(key, self.order) {
                self.result.structural(
                    page.id,
                    format!("Separator {idx} of branch {} outside its parent's range", page.id),
                );
                break;
            }
        }

        for idx in 0..=count {
            let child = Bounds {
                lower: if idx == 0 { bounds.lower } else { Some(branch.key(idx - 1)) },
                upper: if idx == count { bounds.upper } else { Some(branch.key(idx)) },
            };
            self.visit(branch.child_at(idx), child, depth + 1);
        }
    }

    fn visit_overflow(&mut self, head: PageId, len: usize) {
        let expected = pages_for(len, self.scrubber.db.page_size);
        let mut current = head;
        for _ in 0..expected {
            if current == 0 {
                self.result
                    .structural(head, format!("Overflow chain at {head} too short for {len} bytes"));
                return;
            }
            if !self.claim(current) {
                return;
            }
            let page = match self.scrubber.read_raw(current) {
                Ok(page) => page,
                Err(err) => {
                    self.result
                        .checksum(current, format!("Cannot read overflow page {current}: {err}"));
                    return;
                },
            };
            self.result.pages_checked += 1;
            if page.expect_type(PageType::Overflow).is_err() {
                self.result
                    .structural(current, format!("Overflow chain page {current} has the wrong type"));
                return;
            }
            current = next_page(&page);
        }
        if current != 0 {
            self.result
                .structural(head, format!("Overflow chain at {head} continues past {len} bytes"));
        }
    }
}

impl<B: StorageBackend> Database<B> {
    /// Verifies the latest committed snapshot.
    ///
    /// Problems are reported in the returned [`ScrubResult`], not as errors.
    ///
    /// # Errors
    ///
    /// Returns an error only if the snapshot cannot be opened.
    pub fn verify(&self) -> Result<ScrubResult> {
        let snapshot = self.read()?;
        let result = IntegrityScrubber::new(self).verify_tree(snapshot.root(), snapshot.order());
        drop(snapshot);

        if result.is_clean() {
            tracing::debug!(
                pages = result.pages_checked,
                entries = result.entries_checked,
                "Integrity check passed"
            );
        } else {
            tracing::warn!(
                pages = result.pages_checked,
                checksum_errors = result.checksum_errors,
                structural_errors = result.structural_errors,
                "Integrity check found errors"
            );
        }
        Ok(result)
    }
}
