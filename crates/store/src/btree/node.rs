//! Slotted leaf and branch node layouts.
//!
//! ```text
//! Leaf page                          Branch page
//! 0    page header (24 bytes)        0    page header (24 bytes)
//! 24   upper: u16                    24   upper: u16
//! 26   slots: [u16; count]           26   rightmost child: u64
//!      ... free space ...            34   slots: [u16; count]
//! upper cells, growing downward           ... free space ...
//!                                    upper cells, growing downward
//! ```
//!
//! ```text
//! Leaf cell:   flags u8 | key_len u16 | value_len u32 | key | value or overflow head u64
//! Branch cell: key_len u16 | child u64 | key
//! ```
//!
//! Slots hold absolute cell offsets and stay sorted by key under the tree's
//! [`KeyOrder`]. Branch cell `i` points at the subtree whose keys are below
//! `key(i)` and at or above `key(i - 1)`; keys at or above the last
//! separator live under the rightmost child. Removing a cell leaves a hole
//! that is reclaimed by defragmenting when an insert needs the room.

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    error::{Error, PageId, PageType, Result},
    page::{PAGE_HEADER_SIZE, Page},
    types::KeyOrder,
};

const UPPER_OFFSET: usize = PAGE_HEADER_SIZE;
const RIGHTMOST_OFFSET: usize = PAGE_HEADER_SIZE + 2;

/// First slot offset in a leaf page.
pub const LEAF_SLOTS_START: usize = PAGE_HEADER_SIZE + 2;
/// First slot offset in a branch page.
pub const BRANCH_SLOTS_START: usize = PAGE_HEADER_SIZE + 10;
/// Bytes per slot entry.
pub const SLOT_SIZE: usize = 2;
/// Fixed part of a leaf cell: flags, key length, value length.
pub const LEAF_CELL_HEADER: usize = 7;
/// Fixed part of a branch cell: key length, child.
pub const BRANCH_CELL_HEADER: usize = 10;
/// Size of the overflow head reference stored in place of a value.
pub const OVERFLOW_REF_SIZE: usize = 8;

const FLAG_OVERFLOW: u8 = 0x01;

/// Largest cell allowed in any node: a quarter of the branch capacity, so
/// every page holds at least four cells and a split always succeeds.
pub fn max_cell_size(page_size: usize) -> usize {
    (page_size - BRANCH_SLOTS_START) / 4 - SLOT_SIZE
}

/// Largest key accepted by the tree.
pub fn max_key_size(page_size: usize) -> usize {
    max_cell_size(page_size) - LEAF_CELL_HEADER - OVERFLOW_REF_SIZE
}

/// Whether a value of `value_len` bytes can sit inline next to its key.
pub fn fits_inline(page_size: usize, key_len: usize, value_len: usize) -> bool {
    LEAF_CELL_HEADER + key_len + value_len <= max_cell_size(page_size)
}

/// Bytes available for slots and cells in a leaf.
pub fn leaf_capacity(page_size: usize) -> usize {
    page_size - LEAF_SLOTS_START
}

/// Bytes available for slots and cells in a branch.
pub fn branch_capacity(page_size: usize) -> usize {
    page_size - BRANCH_SLOTS_START
}

/// Result of a binary search within a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// Key found at the given index.
    Found(usize),
    /// Key absent; the index is where it would be inserted.
    NotFound(usize),
}

/// Value stored in a leaf cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafValue<'a> {
    /// Value bytes stored in the cell.
    Inline(&'a [u8]),
    /// Value stored in an overflow chain.
    Overflow {
        /// First page of the chain.
        head: PageId,
        /// Total value length in bytes.
        len: u32,
    },
}

impl LeafValue<'_> {
    /// Total value length in bytes.
    pub fn len(&self) -> usize {
        match self {
            LeafValue::Inline(bytes) => bytes.len(),
            LeafValue::Overflow { len, .. } => *len as usize,
        }
    }

    /// Whether the value is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encodes a leaf cell.
pub fn leaf_cell(key: &[u8], value: LeafValue<'_>) -> Vec<u8> {
    let stored = match value {
        LeafValue::Inline(bytes) => bytes.len(),
        LeafValue::Overflow { .. } => OVERFLOW_REF_SIZE,
    };
    let mut cell = vec![0u8; LEAF_CELL_HEADER + key.len() + stored];
    LittleEndian::write_u16(&mut cell[1..3], key.len() as u16);
    cell[LEAF_CELL_HEADER..LEAF_CELL_HEADER + key.len()].copy_from_slice(key);
    let body = LEAF_CELL_HEADER + key.len();
    match value {
        LeafValue::Inline(bytes) => {
            LittleEndian::write_u32(&mut cell[3..7], bytes.len() as u32);
            cell[body..].copy_from_slice(bytes);
        },
        LeafValue::Overflow { head, len } => {
            cell[0] = FLAG_OVERFLOW;
            LittleEndian::write_u32(&mut cell[3..7], len);
            LittleEndian::write_u64(&mut cell[body..], head);
        },
    }
    cell
}

/// Encodes a branch cell.
pub fn branch_cell(key: &[u8], child: PageId) -> Vec<u8> {
    let mut cell = vec![0u8; BRANCH_CELL_HEADER + key.len()];
    LittleEndian::write_u16(&mut cell[0..2], key.len() as u16);
    LittleEndian::write_u64(&mut cell[2..10], child);
    cell[BRANCH_CELL_HEADER..].copy_from_slice(key);
    cell
}

/// Key of an encoded leaf cell.
pub fn leaf_cell_key(cell: &[u8]) -> &[u8] {
    let key_len = LittleEndian::read_u16(&cell[1..3]) as usize;
    &cell[LEAF_CELL_HEADER..LEAF_CELL_HEADER + key_len]
}

/// Key of an encoded branch cell.
pub fn branch_cell_key(cell: &[u8]) -> &[u8] {
    let key_len = LittleEndian::read_u16(&cell[0..2]) as usize;
    &cell[BRANCH_CELL_HEADER..BRANCH_CELL_HEADER + key_len]
}

/// Child pointer of an encoded branch cell.
pub fn branch_cell_child(cell: &[u8]) -> PageId {
    LittleEndian::read_u64(&cell[2..10])
}

/// Replaces the child pointer of an encoded branch cell.
pub fn set_branch_cell_child(cell: &mut [u8], child: PageId) {
    LittleEndian::write_u64(&mut cell[2..10], child);
}

/// Rewrites the overflow head of an encoded leaf cell, if it has one.
pub fn set_leaf_cell_overflow(cell: &mut [u8], head: PageId) {
    if cell[0] & FLAG_OVERFLOW != 0 {
        let body = LEAF_CELL_HEADER + leaf_cell_key(cell).len();
        LittleEndian::write_u64(&mut cell[body..body + OVERFLOW_REF_SIZE], head);
    }
}

/// Decodes the value of an encoded leaf cell.
pub fn leaf_cell_value(cell: &[u8]) -> LeafValue<'_> {
    let key_len = LittleEndian::read_u16(&cell[1..3]) as usize;
    let value_len = LittleEndian::read_u32(&cell[3..7]);
    let body = LEAF_CELL_HEADER + key_len;
    if cell[0] & FLAG_OVERFLOW != 0 {
        LeafValue::Overflow { head: LittleEndian::read_u64(&cell[body..body + 8]), len: value_len }
    } else {
        LeafValue::Inline(&cell[body..body + value_len as usize])
    }
}

fn leaf_cell_len(data: &[u8], offset: usize) -> usize {
    let key_len = LittleEndian::read_u16(&data[offset + 1..offset + 3]) as usize;
    let stored = if data[offset] & FLAG_OVERFLOW != 0 {
        OVERFLOW_REF_SIZE
    } else {
        LittleEndian::read_u32(&data[offset + 3..offset + 7]) as usize
    };
    LEAF_CELL_HEADER + key_len + stored
}

fn branch_cell_len(data: &[u8], offset: usize) -> usize {
    BRANCH_CELL_HEADER + LittleEndian::read_u16(&data[offset..offset + 2]) as usize
}

/// Layout shared by leaves and branches; only the slot start and the cell
/// length decoding differ.
#[derive(Clone, Copy)]
struct Layout {
    slots_start: usize,
    cell_len: fn(&[u8], usize) -> usize,
}

const LEAF: Layout = Layout { slots_start: LEAF_SLOTS_START, cell_len: leaf_cell_len };
const BRANCH: Layout = Layout { slots_start: BRANCH_SLOTS_START, cell_len: branch_cell_len };

impl Layout {
    fn count(self, data: &[u8]) -> usize {
        LittleEndian::read_u16(&data[2..4]) as usize
    }

    fn upper(self, data: &[u8]) -> usize {
        LittleEndian::read_u16(&data[UPPER_OFFSET..UPPER_OFFSET + 2]) as usize
    }

    fn slot(self, data: &[u8], idx: usize) -> usize {
        let at = self.slots_start + idx * SLOT_SIZE;
        LittleEndian::read_u16(&data[at..at + SLOT_SIZE]) as usize
    }

    fn cell(self, data: &[u8], idx: usize) -> &[u8] {
        let offset = self.slot(data, idx);
        &data[offset..offset + (self.cell_len)(data, offset)]
    }

    /// Bytes taken by slots and live cells.
    fn used(self, data: &[u8]) -> usize {
        let count = self.count(data);
        (0..count).map(|i| (self.cell_len)(data, self.slot(data, i)) + SLOT_SIZE).sum()
    }

    fn free_space(self, data: &[u8]) -> usize {
        data.len() - self.slots_start - self.used(data)
    }

    fn init(self, page: &mut Page) {
        let size = page.size();
        page.data[PAGE_HEADER_SIZE..].fill(0);
        page.set_item_count(0);
        LittleEndian::write_u16(&mut page.data[UPPER_OFFSET..UPPER_OFFSET + 2], size as u16);
    }

    fn set_upper(self, page: &mut Page, upper: usize) {
        LittleEndian::write_u16(&mut page.data[UPPER_OFFSET..UPPER_OFFSET + 2], upper as u16);
    }

    /// Packs all live cells against the end of the page.
    fn defragment(self, page: &mut Page) {
        let count = self.count(&page.data);
        let cells: Vec<Vec<u8>> = (0..count).map(|i| self.cell(&page.data, i).to_vec()).collect();
        let mut upper = page.size();
        for (i, cell) in cells.iter().enumerate() {
            upper -= cell.len();
            page.data[upper..upper + cell.len()].copy_from_slice(cell);
            let at = self.slots_start + i * SLOT_SIZE;
            LittleEndian::write_u16(&mut page.data[at..at + SLOT_SIZE], upper as u16);
        }
        let slots_end = self.slots_start + count * SLOT_SIZE;
        page.data[slots_end..upper].fill(0);
        self.set_upper(page, upper);
        page.dirty = true;
    }

    fn insert_cell(self, page: &mut Page, idx: usize, cell: &[u8]) -> Result<()> {
        let count = self.count(&page.data);
        if idx > count {
            return Err(Error::Corrupted {
                reason: format!("Cell index {idx} out of bounds (count {count})"),
            });
        }
        let needed = cell.len() + SLOT_SIZE;
        if self.free_space(&page.data) < needed {
            return Err(Error::PageFull);
        }
        let slots_end = self.slots_start + count * SLOT_SIZE;
        if self.upper(&page.data) - slots_end < needed {
            self.defragment(page);
        }

        let upper = self.upper(&page.data) - cell.len();
        page.data[upper..upper + cell.len()].copy_from_slice(cell);

        let at = self.slots_start + idx * SLOT_SIZE;
        page.data.copy_within(at..slots_end, at + SLOT_SIZE);
        LittleEndian::write_u16(&mut page.data[at..at + SLOT_SIZE], upper as u16);

        self.set_upper(page, upper);
        page.set_item_count((count + 1) as u16);
        Ok(())
    }

    fn remove_cell(self, page: &mut Page, idx: usize) -> Result<()> {
        let count = self.count(&page.data);
        if idx >= count {
            return Err(Error::Corrupted {
                reason: format!("Cell index {idx} out of bounds (count {count})"),
            });
        }
        let at = self.slots_start + idx * SLOT_SIZE;
        let slots_end = self.slots_start + count * SLOT_SIZE;
        page.data.copy_within(at + SLOT_SIZE..slots_end, at);
        page.data[slots_end - SLOT_SIZE..slots_end].fill(0);
        page.set_item_count((count - 1) as u16);
        if count == 1 {
            let size = page.size();
            page.data[self.slots_start..].fill(0);
            self.set_upper(page, size);
        }
        Ok(())
    }

    /// Structural sanity check on slot and cell bounds.
    fn check(self, page: &Page) -> Result<()> {
        let data = &page.data;
        let count = self.count(data);
        let upper = self.upper(data);
        let slots_end = self.slots_start + count * SLOT_SIZE;
        if slots_end > upper || upper > data.len() {
            return Err(Error::Corrupted {
                reason: format!("Node page {} has overlapping slots and cells", page.id),
            });
        }
        for i in 0..count {
            let offset = self.slot(data, i);
            let header = if self.slots_start == LEAF_SLOTS_START {
                LEAF_CELL_HEADER
            } else {
                BRANCH_CELL_HEADER
            };
            if offset < upper || offset + header > data.len() {
                return Err(Error::Corrupted {
                    reason: format!("Cell {i} of page {} points outside the cell area", page.id),
                });
            }
            if offset + (self.cell_len)(data, offset) > data.len() {
                return Err(Error::Corrupted {
                    reason: format!("Cell {i} of page {} runs past the page end", page.id),
                });
            }
        }
        Ok(())
    }
}

fn binary_search<'a>(
    count: usize,
    key_at: impl Fn(usize) -> &'a [u8],
    key: &[u8],
    order: KeyOrder,
) -> SearchResult {
    let (mut lo, mut hi) = (0, count);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match order.compare(key_at(mid), key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return SearchResult::Found(mid),
        }
    }
    SearchResult::NotFound(lo)
}

/// Read-only view of a leaf page.
#[derive(Clone, Copy)]
pub struct LeafNodeRef<'a> {
    page: &'a Page,
}

impl<'a> LeafNodeRef<'a> {
    /// Wraps a leaf page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] for other page types and
    /// [`Error::Corrupted`] when the slot array is inconsistent.
    pub fn from_page(page: &'a Page) -> Result<Self> {
        page.expect_type(PageType::BTreeLeaf)?;
        LEAF.check(page)?;
        Ok(Self { page })
    }

    /// Number of entries.
    pub fn cell_count(&self) -> usize {
        LEAF.count(&self.page.data)
    }

    /// Raw cell bytes at `idx`.
    pub fn cell(&self, idx: usize) -> &'a [u8] {
        LEAF.cell(&self.page.data, idx)
    }

    /// Key at `idx`.
    pub fn key(&self, idx: usize) -> &'a [u8] {
        leaf_cell_key(self.cell(idx))
    }

    /// Value at `idx`.
    pub fn value(&self, idx: usize) -> LeafValue<'a> {
        leaf_cell_value(self.cell(idx))
    }

    /// Copies out every raw cell in slot order.
    pub fn cells(&self) -> Vec<Vec<u8>> {
        (0..self.cell_count()).map(|i| self.cell(i).to_vec()).collect()
    }

    /// Binary search for `key`.
    pub fn search(&self, key: &[u8], order: KeyOrder) -> SearchResult {
        binary_search(self.cell_count(), |i| self.key(i), key, order)
    }

    /// Bytes taken by slots and cells.
    pub fn used_bytes(&self) -> usize {
        LEAF.used(&self.page.data)
    }

    /// Bytes available for new cells, counting holes.
    pub fn free_space(&self) -> usize {
        LEAF.free_space(&self.page.data)
    }
}

/// Mutable view of a leaf page.
pub struct LeafNode<'a> {
    page: &'a mut Page,
}

impl<'a> LeafNode<'a> {
    /// Resets a page to an empty leaf.
    pub fn init(page: &mut Page) {
        LEAF.init(page);
    }

    /// Wraps a leaf page.
    ///
    /// # Errors
    ///
    /// Same as [`LeafNodeRef::from_page`].
    pub fn from_page(page: &'a mut Page) -> Result<Self> {
        page.expect_type(PageType::BTreeLeaf)?;
        LEAF.check(page)?;
        Ok(Self { page })
    }

    /// Read-only view of the same page.
    pub fn view(&self) -> LeafNodeRef<'_> {
        LeafNodeRef { page: self.page }
    }

    /// Number of entries.
    pub fn cell_count(&self) -> usize {
        LEAF.count(&self.page.data)
    }

    /// Whether a cell of `cell_len` bytes fits, possibly after defragmenting.
    pub fn can_insert(&self, cell_len: usize) -> bool {
        LEAF.free_space(&self.page.data) >= cell_len + SLOT_SIZE
    }

    /// Inserts a pre-encoded cell at `idx`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageFull`] if the cell does not fit.
    pub fn insert_cell(&mut self, idx: usize, cell: &[u8]) -> Result<()> {
        LEAF.insert_cell(self.page, idx, cell)
    }

    /// Inserts an entry at `idx`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageFull`] if the entry does not fit.
    pub fn insert(&mut self, idx: usize, key: &[u8], value: LeafValue<'_>) -> Result<()> {
        self.insert_cell(idx, &leaf_cell(key, value))
    }

    /// Removes the entry at `idx`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if `idx` is out of bounds.
    pub fn remove(&mut self, idx: usize) -> Result<()> {
        LEAF.remove_cell(self.page, idx)
    }

    /// Packs cells to close holes left by removals.
    pub fn defragment(&mut self) {
        LEAF.defragment(self.page);
    }
}

/// Read-only view of a branch page.
#[derive(Clone, Copy)]
pub struct BranchNodeRef<'a> {
    page: &'a Page,
}

impl<'a> BranchNodeRef<'a> {
    /// Wraps a branch page.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] for other page types and
    /// [`Error::Corrupted`] when the slot array is inconsistent.
    pub fn from_page(page: &'a Page) -> Result<Self> {
        page.expect_type(PageType::BTreeBranch)?;
        BRANCH.check(page)?;
        Ok(Self { page })
    }

    /// Number of separator cells. The node has one more child than this.
    pub fn cell_count(&self) -> usize {
        BRANCH.count(&self.page.data)
    }

    /// Raw cell bytes at `idx`.
    pub fn cell(&self, idx: usize) -> &'a [u8] {
        BRANCH.cell(&self.page.data, idx)
    }

    /// Separator key at `idx`.
    pub fn key(&self, idx: usize) -> &'a [u8] {
        branch_cell_key(self.cell(idx))
    }

    /// Child left of separator `idx`.
    pub fn child(&self, idx: usize) -> PageId {
        branch_cell_child(self.cell(idx))
    }

    /// Child holding keys at or above the last separator.
    pub fn rightmost_child(&self) -> PageId {
        LittleEndian::read_u64(&self.page.data[RIGHTMOST_OFFSET..RIGHTMOST_OFFSET + 8])
    }

    /// Child by position, where `cell_count()` names the rightmost child.
    pub fn child_at(&self, idx: usize) -> PageId {
        if idx >= self.cell_count() { self.rightmost_child() } else { self.child(idx) }
    }

    /// Position of the child whose subtree covers `key`.
    pub fn child_index(&self, key: &[u8], order: KeyOrder) -> usize {
        match binary_search(self.cell_count(), |i| self.key(i), key, order) {
            SearchResult::Found(idx) => idx + 1,
            SearchResult::NotFound(idx) => idx,
        }
    }

    /// Child whose subtree covers `key`.
    pub fn child_for_key(&self, key: &[u8], order: KeyOrder) -> PageId {
        self.child_at(self.child_index(key, order))
    }

    /// Copies out every raw cell in slot order.
    pub fn cells(&self) -> Vec<Vec<u8>> {
        (0..self.cell_count()).map(|i| self.cell(i).to_vec()).collect()
    }

    /// Bytes taken by slots and cells.
    pub fn used_bytes(&self) -> usize {
        BRANCH.used(&self.page.data)
    }

    /// Bytes available for new cells, counting holes.
    pub fn free_space(&self) -> usize {
        BRANCH.free_space(&self.page.data)
    }
}

/// Mutable view of a branch page.
pub struct BranchNode<'a> {
    page: &'a mut Page,
}

impl<'a> BranchNode<'a> {
    /// Resets a page to an empty branch with a single child.
    pub fn init(page: &mut Page, rightmost_child: PageId) {
        BRANCH.init(page);
        LittleEndian::write_u64(
            &mut page.data[RIGHTMOST_OFFSET..RIGHTMOST_OFFSET + 8],
            rightmost_child,
        );
    }

    /// Wraps a branch page.
    ///
    /// # Errors
    ///
    /// Same as [`BranchNodeRef::from_page`].
    pub fn from_page(page: &'a mut Page) -> Result<Self> {
        page.expect_type(PageType::BTreeBranch)?;
        BRANCH.check(page)?;
        Ok(Self { page })
    }

    /// Read-only view of the same page.
    pub fn view(&self) -> BranchNodeRef<'_> {
        BranchNodeRef { page: self.page }
    }

    /// Number of separator cells.
    pub fn cell_count(&self) -> usize {
        BRANCH.count(&self.page.data)
    }

    /// Whether a cell of `cell_len` bytes fits, possibly after defragmenting.
    pub fn can_insert(&self, cell_len: usize) -> bool {
        BRANCH.free_space(&self.page.data) >= cell_len + SLOT_SIZE
    }

    /// Inserts a pre-encoded cell at `idx`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageFull`] if the cell does not fit.
    pub fn insert_cell(&mut self, idx: usize, cell: &[u8]) -> Result<()> {
        BRANCH.insert_cell(self.page, idx, cell)
    }

    /// Inserts separator `key` with `child` as its left child.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageFull`] if the cell does not fit.
    pub fn insert(&mut self, idx: usize, key: &[u8], child: PageId) -> Result<()> {
        self.insert_cell(idx, &branch_cell(key, child))
    }

    /// Removes separator `idx` together with its left child pointer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if `idx` is out of bounds.
    pub fn remove(&mut self, idx: usize) -> Result<()> {
        BRANCH.remove_cell(self.page, idx)
    }

    /// Points child position `idx` at `child`; `cell_count()` names the
    /// rightmost child.
    pub fn set_child(&mut self, idx: usize, child: PageId) {
        if idx >= self.cell_count() {
            self.set_rightmost_child(child);
        } else {
            let offset = BRANCH.slot(&self.page.data, idx);
            LittleEndian::write_u64(&mut self.page.data[offset + 2..offset + 10], child);
            self.page.dirty = true;
        }
    }

    /// Sets the rightmost child.
    pub fn set_rightmost_child(&mut self, child: PageId) {
        LittleEndian::write_u64(
            &mut self.page.data[RIGHTMOST_OFFSET..RIGHTMOST_OFFSET + 8],
            child,
        );
        self.page.dirty = true;
    }

    /// Packs cells to close holes left by removals.
    pub fn defragment(&mut self) {
        BRANCH.defragment(self.page);
    }
}
