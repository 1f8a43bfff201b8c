//! B+ tree implementation for the store engine.
//!
//! This module provides the ordered map behind every database handle.
//! The implementation is designed for:
//! - Single-writer, multiple-reader access
//! - Copy-on-write: a page that may be visible to a snapshot is never modified in place
//! - Cursor-based iteration over a fixed snapshot
//!
//! ## Structure
//!
//! - `node.rs`: Slotted leaf and branch layouts
//! - `split.rs`: Node splitting on insert and merging on delete
//! - `overflow.rs`: Chains for values too large to store inline
//! - `cursor.rs`: Cursor and bounded iterator
//!
//! ## Copy-on-write
//!
//! Every modified node goes through `BTree::write_cow`: a page the current
//! transaction allocated is rewritten in place, any other page is written
//! to a freshly allocated page number and its old number is handed to
//! [`PageProvider::free_page`]. The provider decides when a freed page may
//! be reused. A parent is rewritten only when a child moved, split or merged,
//! so the chain of new pages always runs up to a new root.

/// Cursor and bounded iteration.
pub mod cursor;
/// Slotted leaf and branch node operations on pages.
pub mod node;
/// Overflow chains for large values.
pub mod overflow;
/// Node splitting and merging.
pub mod split;

use node::{
    BranchNode, BranchNodeRef, LeafNode, LeafNodeRef, LeafValue, SearchResult, branch_cell,
    fits_inline, leaf_cell, max_key_size,
};
use overflow::{free_overflow, load_value, write_overflow};
use split::{
    UNDERFLOW_FILL, branch_fill_factor, can_merge_branches, can_merge_leaves, leaf_fill_factor,
    merge_branches, merge_leaves, split_branch, split_leaf,
};

use crate::{
    error::{Error, PageId, PageType, Result},
    page::Page,
    types::{KeyOrder, PutFlags},
};

/// Deepest tree accepted before a walk reports corruption.
pub const MAX_DEPTH: usize = 64;

/// Read access to the pages of one snapshot.
pub trait PageSource {
    /// Reads a page by ID.
    fn read_page(&self, page_id: PageId) -> Result<Page>;

    /// Returns the page size.
    fn page_size(&self) -> usize;
}

/// Read-write page access for a write transaction.
///
/// This abstraction lets the tree run against the transaction overlay in
/// the engine and against a plain map in tests.
pub trait PageProvider: PageSource {
    /// Stores a page under its own `id`.
    fn write_page(&mut self, page: Page) -> Result<()>;

    /// Allocates a fresh page of the given type.
    fn allocate_page(&mut self, page_type: PageType) -> Result<Page>;

    /// Gives up a page number. Pages from older snapshots are only reused
    /// once no reader can see them.
    fn free_page(&mut self, page_id: PageId);

    /// Whether the page was allocated by the current transaction and may be
    /// modified in place.
    fn is_writable(&self, page_id: PageId) -> bool;

    /// Returns the current transaction ID.
    fn txn_id(&self) -> u64;
}

impl<S: PageSource + ?Sized> PageSource for &S {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        (**self).read_page(page_id)
    }

    fn page_size(&self) -> usize {
        (**self).page_size()
    }
}

impl<S: PageSource + ?Sized> PageSource for &mut S {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        (**self).read_page(page_id)
    }

    fn page_size(&self) -> usize {
        (**self).page_size()
    }
}

impl<P: PageProvider + ?Sized> PageProvider for &mut P {
    fn write_page(&mut self, page: Page) -> Result<()> {
        (**self).write_page(page)
    }

    fn allocate_page(&mut self, page_type: PageType) -> Result<Page> {
        (**self).allocate_page(page_type)
    }

    fn free_page(&mut self, page_id: PageId) {
        (**self).free_page(page_id)
    }

    fn is_writable(&self, page_id: PageId) -> bool {
        (**self).is_writable(page_id)
    }

    fn txn_id(&self) -> u64 {
        (**self).txn_id()
    }
}

/// Looks up `key` in the tree rooted at `root`.
///
/// # Errors
///
/// Returns an error if a page read fails or the tree structure is invalid.
pub fn search<S: PageSource + ?Sized>(
    source: &S,
    root: PageId,
    order: KeyOrder,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    if root == 0 {
        return Ok(None);
    }

    let mut page_id = root;
    for _ in 0..MAX_DEPTH {
        let page = source.read_page(page_id)?;
        match page.page_type()? {
            PageType::BTreeLeaf => {
                let leaf = LeafNodeRef::from_page(&page)?;
                return match leaf.search(key, order) {
                    SearchResult::Found(idx) => Ok(Some(load_value(source, leaf.value(idx))?)),
                    SearchResult::NotFound(_) => Ok(None),
                };
            },
            PageType::BTreeBranch => {
                page_id = BranchNodeRef::from_page(&page)?.child_for_key(key, order);
            },
            found => {
                return Err(Error::PageTypeMismatch { expected: PageType::BTreeLeaf, found });
            },
        }
    }
    Err(Error::Corrupted { reason: format!("Tree under root {root} deeper than {MAX_DEPTH}") })
}

/// Rejects keys that can never be stored with `page_size` pages.
///
/// # Errors
///
/// Returns [`Error::EmptyKey`] or [`Error::KeyTooLarge`].
pub fn check_key(key: &[u8], page_size: usize) -> Result<()> {
    if key.is_empty() {
        return Err(Error::EmptyKey);
    }
    let max = max_key_size(page_size);
    if key.len() > max {
        return Err(Error::KeyTooLarge { size: key.len(), max });
    }
    Ok(())
}

/// Computes the depth of a tree (0 = empty, 1 = root is leaf, 2+ = branches + leaf).
///
/// Walks the leftmost path from root to leaf.
///
/// # Errors
///
/// Returns an error if a page read fails or a non-B-tree page type is encountered.
pub fn depth<S: PageSource + ?Sized>(source: &S, root: PageId) -> Result<u32> {
    if root == 0 {
        return Ok(0);
    }

    let mut page_id = root;
    for depth in 1..=MAX_DEPTH as u32 {
        let page = source.read_page(page_id)?;
        match page.page_type()? {
            PageType::BTreeLeaf => return Ok(depth),
            PageType::BTreeBranch => page_id = BranchNodeRef::from_page(&page)?.child_at(0),
            found => {
                return Err(Error::PageTypeMismatch { expected: PageType::BTreeLeaf, found });
            },
        }
    }
    Err(Error::Corrupted { reason: format!("Tree under root {root} deeper than {MAX_DEPTH}") })
}

/// Whether an insert added a key or replaced an existing value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key was new.
    Inserted,
    /// The key existed and its value was replaced.
    Replaced,
}

/// Result of rewriting one node on the insert path.
struct Rewrite {
    /// Where the node lives now.
    page_id: PageId,
    /// Separator and right sibling if the node split.
    split: Option<(Vec<u8>, PageId)>,
}

/// Result of a delete below a node.
struct Removal {
    page_id: PageId,
    underflow: bool,
}

/// Copy-on-write B+ tree over a page provider.
///
/// A `BTree` is a short-lived accessor: the caller hands in the current
/// root, runs mutations, and reads the new root back with
/// [`root_page`](Self::root_page). A failed mutation leaves the root
/// unchanged; undoing the pages it already wrote is up to the provider.
pub struct BTree<P: PageProvider> {
    /// Page provider for reading/writing pages.
    provider: P,
    /// Root page ID (0 = empty tree).
    root_page: PageId,
    /// Key comparator.
    order: KeyOrder,
    /// Number of page splits performed during this BTree's lifetime.
    split_count: u64,
    /// Number of sibling merges performed during this BTree's lifetime.
    merge_count: u64,
}

impl<P: PageProvider> BTree<P> {
    /// Creates a new B-tree accessor.
    pub fn new(root_page: PageId, order: KeyOrder, provider: P) -> Self {
        Self { provider, root_page, order, split_count: 0, merge_count: 0 }
    }

    /// Returns the number of page splits performed through this accessor.
    pub fn split_count(&self) -> u64 {
        self.split_count
    }

    /// Returns the number of sibling merges performed through this accessor.
    pub fn merge_count(&self) -> u64 {
        self.merge_count
    }

    /// Checks if the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.root_page == 0
    }

    /// Returns the root page ID.
    pub fn root_page(&self) -> PageId {
        self.root_page
    }

    /// Returns the key comparator.
    pub fn order(&self) -> KeyOrder {
        self.order
    }

    /// Returns the page provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Computes the depth of the tree.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn depth(&self) -> Result<u32> {
        depth(&self.provider, self.root_page)
    }

    /// Returns the value associated with `key`, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails or a page type mismatch is found.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        search(&self.provider, self.root_page, self.order, key)
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        check_key(key, self.provider.page_size())
    }

    /// Inserts or replaces `key`.
    ///
    /// With [`PutFlags::NO_OVERWRITE`] an existing key is left alone and
    /// [`Error::KeyExists`] is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The key is empty or larger than the page size allows
    /// - A page read, write or allocation fails through the `PageProvider`
    pub fn insert(&mut self, key: &[u8], value: &[u8], flags: PutFlags) -> Result<InsertOutcome> {
        self.check_key(key)?;

        if self.root_page == 0 {
            let cell = self.encode_entry(key, value)?;
            let mut page = self.provider.allocate_page(PageType::BTreeLeaf)?;
            LeafNode::init(&mut page);
            LeafNode::from_page(&mut page)?.insert_cell(0, &cell)?;
            let root = page.id;
            self.provider.write_page(page)?;
            self.root_page = root;
            return Ok(InsertOutcome::Inserted);
        }

        let mut outcome = InsertOutcome::Inserted;
        let rewrite = self.insert_into(self.root_page, key, value, flags, &mut outcome)?;

        self.root_page = match rewrite.split {
            None => rewrite.page_id,
            Some((separator, right)) => {
                // Root split: grow the tree by one level.
                let mut root = self.provider.allocate_page(PageType::BTreeBranch)?;
                BranchNode::init(&mut root, right);
                BranchNode::from_page(&mut root)?.insert(0, &separator, rewrite.page_id)?;
                let root_id = root.id;
                self.provider.write_page(root)?;
                root_id
            },
        };
        Ok(outcome)
    }

    /// Builds the leaf cell for an entry, spilling the value to an overflow
    /// chain when it does not fit inline.
    fn encode_entry(&mut self, key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
        if fits_inline(self.provider.page_size(), key.len(), value.len()) {
            return Ok(leaf_cell(key, LeafValue::Inline(value)));
        }
        let head = write_overflow(&mut self.provider, value)?;
        Ok(leaf_cell(key, LeafValue::Overflow { head, len: value.len() as u32 }))
    }

    fn insert_into(
        &mut self,
        page_id: PageId,
        key: &[u8],
        value: &[u8],
        flags: PutFlags,
        outcome: &mut InsertOutcome,
    ) -> Result<Rewrite> {
        let mut page = self.provider.read_page(page_id)?;

        match page.page_type()? {
            PageType::BTreeLeaf => {
                let found = LeafNodeRef::from_page(&page)?.search(key, self.order);
                let idx = match found {
                    SearchResult::Found(idx) => {
                        if flags.contains(PutFlags::NO_OVERWRITE) {
                            return Err(Error::KeyExists);
                        }
                        if let LeafValue::Overflow { head, len } =
                            LeafNodeRef::from_page(&page)?.value(idx)
                        {
                            free_overflow(&mut self.provider, head, len as usize)?;
                        }
                        LeafNode::from_page(&mut page)?.remove(idx)?;
                        *outcome = InsertOutcome::Replaced;
                        idx
                    },
                    SearchResult::NotFound(idx) => idx,
                };

                let cell = self.encode_entry(key, value)?;
                let mut leaf = LeafNode::from_page(&mut page)?;
                if leaf.can_insert(cell.len()) {
                    leaf.insert_cell(idx, &cell)?;
                    let page_id = self.write_cow(page)?;
                    return Ok(Rewrite { page_id, split: None });
                }

                let mut cells = leaf.view().cells();
                cells.insert(idx, cell);
                let mut right = self.provider.allocate_page(PageType::BTreeLeaf)?;
                let separator = split_leaf(&mut page, &mut right, &cells)?;
                self.split_count += 1;

                let right_id = right.id;
                self.provider.write_page(right)?;
                let left_id = self.write_cow(page)?;
                Ok(Rewrite { page_id: left_id, split: Some((separator, right_id)) })
            },
            PageType::BTreeBranch => {
                let (idx, child) = {
                    let branch = BranchNodeRef::from_page(&page)?;
                    let idx = branch.child_index(key, self.order);
                    (idx, branch.child_at(idx))
                };

                let below = self.insert_into(child, key, value, flags, outcome)?;
                let Some((separator, right_child)) = below.split else {
                    if below.page_id == child {
                        return Ok(Rewrite { page_id, split: None });
                    }
                    BranchNode::from_page(&mut page)?.set_child(idx, below.page_id);
                    let page_id = self.write_cow(page)?;
                    return Ok(Rewrite { page_id, split: None });
                };

                // The child split: its left half stays left of the new
                // separator, and the slot that pointed at it now takes the
                // right half.
                let cell = branch_cell(&separator, below.page_id);
                let mut branch = BranchNode::from_page(&mut page)?;
                branch.set_child(idx, right_child);
                if branch.can_insert(cell.len()) {
                    branch.insert_cell(idx, &cell)?;
                    let page_id = self.write_cow(page)?;
                    return Ok(Rewrite { page_id, split: None });
                }

                let mut cells = branch.view().cells();
                let rightmost = branch.view().rightmost_child();
                cells.insert(idx, cell);
                let mut right = self.provider.allocate_page(PageType::BTreeBranch)?;
                let promoted = split_branch(&mut page, &mut right, &cells, rightmost)?;
                self.split_count += 1;

                let right_id = right.id;
                self.provider.write_page(right)?;
                let left_id = self.write_cow(page)?;
                Ok(Rewrite { page_id: left_id, split: Some((promoted, right_id)) })
            },
            found => Err(Error::PageTypeMismatch { expected: PageType::BTreeLeaf, found }),
        }
    }

    /// Deletes `key`, returning whether it was present.
    ///
    /// Underfull nodes are merged with a sibling when the pair fits in one
    /// page. A branch root left with a single child is replaced by that
    /// child, and an empty leaf root leaves an empty tree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyKey`] for an empty key, or an error if a page
    /// read/write fails during the deletion.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        if self.root_page == 0 {
            return Ok(false);
        }

        let Some(removal) = self.delete_from(self.root_page, key)? else {
            return Ok(false);
        };
        self.root_page = self.collapse_root(removal.page_id)?;
        Ok(true)
    }

    fn delete_from(&mut self, page_id: PageId, key: &[u8]) -> Result<Option<Removal>> {
        let mut page = self.provider.read_page(page_id)?;

        match page.page_type()? {
            PageType::BTreeLeaf => {
                let idx = match LeafNodeRef::from_page(&page)?.search(key, self.order) {
                    SearchResult::Found(idx) => idx,
                    SearchResult::NotFound(_) => return Ok(None),
                };
                if let LeafValue::Overflow { head, len } = LeafNodeRef::from_page(&page)?.value(idx) {
                    free_overflow(&mut self.provider, head, len as usize)?;
                }
                LeafNode::from_page(&mut page)?.remove(idx)?;

                let underflow = leaf_fill_factor(&page)? < UNDERFLOW_FILL;
                let page_id = self.write_cow(page)?;
                Ok(Some(Removal { page_id, underflow }))
            },
            PageType::BTreeBranch => {
                let (idx, child) = {
                    let branch = BranchNodeRef::from_page(&page)?;
                    let idx = branch.child_index(key, self.order);
                    (idx, branch.child_at(idx))
                };

                let Some(below) = self.delete_from(child, key)? else {
                    return Ok(None);
                };

                let mut changed = below.page_id != child;
                if changed {
                    BranchNode::from_page(&mut page)?.set_child(idx, below.page_id);
                }
                if below.underflow && page.item_count() > 0 {
                    changed |= self.merge_child(&mut page, idx)?;
                }

                let underflow = branch_fill_factor(&page)? < UNDERFLOW_FILL;
                let page_id = if changed { self.write_cow(page)? } else { page_id };
                Ok(Some(Removal { page_id, underflow }))
            },
            found => Err(Error::PageTypeMismatch { expected: PageType::BTreeLeaf, found }),
        }
    }

    /// Merges child `idx` of `parent` with its left sibling (or its right
    /// sibling when it is the first child) if both fit in one page.
    ///
    /// Returns whether `parent` was modified.
    fn merge_child(&mut self, parent: &mut Page, idx: usize) -> Result<bool> {
        let (left_idx, left_id, right_id, separator) = {
            let branch = BranchNodeRef::from_page(parent)?;
            let left_idx = idx.saturating_sub(1);
            (
                left_idx,
                branch.child_at(left_idx),
                branch.child_at(left_idx + 1),
                branch.key(left_idx).to_vec(),
            )
        };

        let mut left = self.provider.read_page(left_id)?;
        let right = self.provider.read_page(right_id)?;
        match left.page_type()? {
            PageType::BTreeLeaf => {
                if !can_merge_leaves(&left, &right)? {
                    return Ok(false);
                }
                merge_leaves(&mut left, &right)?;
            },
            PageType::BTreeBranch => {
                if !can_merge_branches(&left, &right, &separator)? {
                    return Ok(false);
                }
                merge_branches(&mut left, &right, &separator)?;
            },
            found => {
                return Err(Error::PageTypeMismatch { expected: PageType::BTreeLeaf, found });
            },
        }

        let merged = self.write_cow(left)?;
        self.provider.free_page(right_id);

        // Dropping separator `left_idx` shifts the slot that pointed at the
        // right sibling into position `left_idx`.
        let mut branch = BranchNode::from_page(parent)?;
        branch.remove(left_idx)?;
        branch.set_child(left_idx, merged);
        self.merge_count += 1;
        Ok(true)
    }

    /// Shrinks the tree from the top after a delete: an empty leaf root
    /// becomes an empty tree and a branch root with one child is replaced
    /// by that child.
    fn collapse_root(&mut self, mut root: PageId) -> Result<PageId> {
        for _ in 0..MAX_DEPTH {
            let page = self.provider.read_page(root)?;
            if page.item_count() > 0 {
                return Ok(root);
            }
            match page.page_type()? {
                PageType::BTreeLeaf => {
                    self.provider.free_page(root);
                    return Ok(0);
                },
                PageType::BTreeBranch => {
                    let child = BranchNodeRef::from_page(&page)?.rightmost_child();
                    self.provider.free_page(root);
                    root = child;
                },
                found => {
                    return Err(Error::PageTypeMismatch { expected: PageType::BTreeLeaf, found });
                },
            }
        }
        Err(Error::Corrupted { reason: format!("Tree under root {root} deeper than {MAX_DEPTH}") })
    }

    /// Writes a modified node, relocating it unless the current
    /// transaction already owns its page.
    ///
    /// Returns the page number the node now lives at.
    fn write_cow(&mut self, mut page: Page) -> Result<PageId> {
        let original = page.id;
        if self.provider.is_writable(original) {
            self.provider.write_page(page)?;
            return Ok(original);
        }

        let fresh = self.provider.allocate_page(page.page_type()?)?;
        page.relocate(fresh.id);
        self.provider.write_page(page)?;
        self.provider.free_page(original);
        Ok(fresh.id)
    }
}
