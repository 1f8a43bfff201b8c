//! Node splitting, merging, and fill factor analysis for the B+ tree.
//!
//! # Algorithm Overview
//!
//! ## Splitting (insertion path)
//!
//! When a node cannot take a new cell, the caller collects the node's cells
//! with the new cell already in position and hands them to a split function:
//!
//! 1. **Leaf split** (`split_leaf`): cells are divided at the byte midpoint. The original page
//!    keeps the left half, a freshly allocated page takes the right half, and the first key of the
//!    right half is copied up as the separator.
//!
//! 2. **Branch split** (`split_branch`): the cell nearest the byte midpoint is promoted. Its key
//!    becomes the separator and its child becomes the rightmost child of the left half; the right
//!    half keeps the original rightmost child.
//!
//! No cell is larger than a quarter of a page, so each half of a split
//! always fits in one page.
//!
//! ## Merging (deletion path)
//!
//! When a child drops below [`UNDERFLOW_FILL`] after a delete, the parent
//! tries to merge it with an adjacent sibling:
//!
//! 1. Leaves concatenate their cells into the left page.
//! 2. Branches pull the parent's separator down between the two halves, pointing it at the left
//!    node's rightmost child.
//!
//! Both rebuild the left page from scratch, so holes left by removals never
//! count against the merged size. If the pair does not fit in one page the
//! node stays underfull; it remains valid, just sparse.

use super::node::{
    BranchNode, BranchNodeRef, LeafNode, LeafNodeRef, SLOT_SIZE, branch_capacity, branch_cell,
    branch_cell_child, branch_cell_key, leaf_capacity, leaf_cell_key,
};
use crate::{
    error::{Error, PageId, Result},
    page::Page,
};

/// Fill fraction below which a node is considered underfull.
pub const UNDERFLOW_FILL: f64 = 0.25;

/// Picks the index where the right half starts so both halves carry about
/// the same number of bytes. The result lies in `min_left..=len - min_right`.
fn byte_midpoint(cells: &[Vec<u8>], min_left: usize, min_right: usize) -> usize {
    let total: usize = cells.iter().map(|c| c.len() + SLOT_SIZE).sum();
    let mut acc = 0;
    let mut split_at = cells.len();
    for (i, cell) in cells.iter().enumerate() {
        if acc + (cell.len() + SLOT_SIZE) / 2 >= total / 2 {
            split_at = i;
            break;
        }
        acc += cell.len() + SLOT_SIZE;
    }
    split_at.clamp(min_left, cells.len().saturating_sub(min_right))
}

/// Splits an overfull sequence of leaf cells across `original` (left half)
/// and `new_page` (right half).
///
/// Returns the separator to insert into the parent: the first key of the
/// right half.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] with fewer than two cells, or
/// [`Error::PageFull`] if a half does not fit.
pub fn split_leaf(original: &mut Page, new_page: &mut Page, cells: &[Vec<u8>]) -> Result<Vec<u8>> {
    if cells.len() < 2 {
        return Err(Error::Corrupted { reason: "Leaf split needs at least two cells".into() });
    }
    let split_at = byte_midpoint(cells, 1, 1);

    fill_leaf(original, &cells[..split_at])?;
    fill_leaf(new_page, &cells[split_at..])?;

    Ok(leaf_cell_key(&cells[split_at]).to_vec())
}

/// Splits an overfull sequence of branch cells plus `rightmost_child`
/// across `original` (left half) and `new_page` (right half).
///
/// Returns the promoted separator, which lives in neither half.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] with fewer than three cells, or
/// [`Error::PageFull`] if a half does not fit.
pub fn split_branch(
    original: &mut Page,
    new_page: &mut Page,
    cells: &[Vec<u8>],
    rightmost_child: PageId,
) -> Result<Vec<u8>> {
    if cells.len() < 3 {
        return Err(Error::Corrupted { reason: "Branch split needs at least three cells".into() });
    }
    let promote = byte_midpoint(cells, 1, 2);
    let promoted = &cells[promote];

    fill_branch(original, &cells[..promote], branch_cell_child(promoted))?;
    fill_branch(new_page, &cells[promote + 1..], rightmost_child)?;

    Ok(branch_cell_key(promoted).to_vec())
}

fn fill_leaf(page: &mut Page, cells: &[Vec<u8>]) -> Result<()> {
    LeafNode::init(page);
    let mut node = LeafNode::from_page(page)?;
    for (i, cell) in cells.iter().enumerate() {
        node.insert_cell(i, cell)?;
    }
    Ok(())
}

fn fill_branch(page: &mut Page, cells: &[Vec<u8>], rightmost_child: PageId) -> Result<()> {
    BranchNode::init(page, rightmost_child);
    let mut node = BranchNode::from_page(page)?;
    for (i, cell) in cells.iter().enumerate() {
        node.insert_cell(i, cell)?;
    }
    Ok(())
}

/// Checks whether two adjacent leaves fit in a single page.
///
/// # Errors
///
/// Returns an error if either page is not a B-tree leaf.
pub fn can_merge_leaves(left: &Page, right: &Page) -> Result<bool> {
    let used = LeafNodeRef::from_page(left)?.used_bytes() + LeafNodeRef::from_page(right)?.used_bytes();
    Ok(used <= leaf_capacity(left.size()))
}

/// Moves every entry of `right` onto the end of `left`.
///
/// The caller frees `right` afterwards.
///
/// # Errors
///
/// Returns an error if either page is not a B-tree leaf or the result does
/// not fit.
pub fn merge_leaves(left: &mut Page, right: &Page) -> Result<()> {
    let mut cells = LeafNodeRef::from_page(left)?.cells();
    cells.extend(LeafNodeRef::from_page(right)?.cells());
    fill_leaf(left, &cells)
}

/// Checks whether two adjacent branches, plus the separator pulled down
/// from their parent, fit in a single page.
///
/// # Errors
///
/// Returns an error if either page is not a B-tree branch.
pub fn can_merge_branches(left: &Page, right: &Page, separator: &[u8]) -> Result<bool> {
    let used = BranchNodeRef::from_page(left)?.used_bytes()
        + BranchNodeRef::from_page(right)?.used_bytes()
        + branch_cell(separator, 0).len()
        + SLOT_SIZE;
    Ok(used <= branch_capacity(left.size()))
}

/// Merges `right` into `left`, pulling `separator` down between them.
///
/// # Errors
///
/// Returns an error if either page is not a B-tree branch or the result
/// does not fit.
pub fn merge_branches(left: &mut Page, right: &Page, separator: &[u8]) -> Result<()> {
    let (mut cells, left_rightmost) = {
        let node = BranchNodeRef::from_page(left)?;
        (node.cells(), node.rightmost_child())
    };
    let right_node = BranchNodeRef::from_page(right)?;
    cells.push(branch_cell(separator, left_rightmost));
    cells.extend(right_node.cells());
    fill_branch(left, &cells, right_node.rightmost_child())
}

/// Fraction of the leaf's capacity taken by live cells and their slots.
///
/// # Errors
///
/// Returns an error if the page is not a B-tree leaf.
pub fn leaf_fill_factor(page: &Page) -> Result<f64> {
    let used = LeafNodeRef::from_page(page)?.used_bytes();
    Ok(used as f64 / leaf_capacity(page.size()) as f64)
}

/// Fraction of the branch's capacity taken by live cells and their slots.
///
/// # Errors
///
/// Returns an error if the page is not a B-tree branch.
pub fn branch_fill_factor(page: &Page) -> Result<f64> {
    let used = BranchNodeRef::from_page(page)?.used_bytes();
    Ok(used as f64 / branch_capacity(page.size()) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::DEFAULT_PAGE_SIZE,
        btree::node::{LeafValue, leaf_cell},
        error::PageType,
    };

    fn leaf(id: PageId) -> Page {
        let mut page = Page::new(id, DEFAULT_PAGE_SIZE, PageType::BTreeLeaf, 1);
        LeafNode::init(&mut page);
        page
    }

    fn branch(id: PageId) -> Page {
        let mut page = Page::new(id, DEFAULT_PAGE_SIZE, PageType::BTreeBranch, 1);
        BranchNode::init(&mut page, 0);
        page
    }

    fn leaf_cells(count: usize, value_len: usize) -> Vec<Vec<u8>> {
        (0..count)
            .map(|i| {
                let key = format!("key{i:04}");
                leaf_cell(key.as_bytes(), LeafValue::Inline(&vec![i as u8; value_len]))
            })
            .collect()
    }

    #[test]
    fn test_leaf_split() {
        let cells = leaf_cells(5, 900);
        let mut left = leaf(1);
        let mut right = leaf(2);

        let separator = split_leaf(&mut left, &mut right, &cells).unwrap();

        let left_node = LeafNodeRef::from_page(&left).unwrap();
        let right_node = LeafNodeRef::from_page(&right).unwrap();
        assert_eq!(left_node.cell_count() + right_node.cell_count(), 5);
        assert!(left_node.cell_count() >= 2);
        assert!(right_node.cell_count() >= 2);
        assert_eq!(separator, right_node.key(0));
    }

    #[test]
    fn test_leaf_split_balances_bytes() {
        // One large cell followed by many small ones: the large cell should
        // not drag half the entries with it.
        let mut cells = vec![leaf_cell(b"a", LeafValue::Inline(&[0u8; 1000]))];
        for i in 0..60u8 {
            cells.push(leaf_cell(&[b'b', i], LeafValue::Inline(&[0u8; 40])));
        }
        let mut left = leaf(1);
        let mut right = leaf(2);
        split_leaf(&mut left, &mut right, &cells).unwrap();

        let left_used = LeafNodeRef::from_page(&left).unwrap().used_bytes();
        let right_used = LeafNodeRef::from_page(&right).unwrap().used_bytes();
        assert!(left_used.abs_diff(right_used) < 1100);
    }

    #[test]
    fn test_branch_split_promotes_median() {
        let cells: Vec<Vec<u8>> =
            (0..9u64).map(|i| branch_cell(format!("k{i}").as_bytes(), 100 + i)).collect();
        let mut left = branch(1);
        let mut right = branch(2);

        let separator = split_branch(&mut left, &mut right, &cells, 999).unwrap();

        let left_node = BranchNodeRef::from_page(&left).unwrap();
        let right_node = BranchNodeRef::from_page(&right).unwrap();
        assert_eq!(left_node.cell_count() + right_node.cell_count(), 8);
        assert_eq!(separator, format!("k{}", left_node.cell_count()).into_bytes());
        // The promoted cell's child becomes the left half's rightmost child.
        assert_eq!(left_node.rightmost_child(), 100 + left_node.cell_count() as u64);
        assert_eq!(right_node.rightmost_child(), 999);
    }

    #[test]
    fn test_split_rejects_tiny_input() {
        let mut left = leaf(1);
        let mut right = leaf(2);
        assert!(split_leaf(&mut left, &mut right, &leaf_cells(1, 10)).is_err());
    }

    #[test]
    fn test_merge_leaves() {
        let mut left = leaf(1);
        let mut right = leaf(2);
        fill_leaf(&mut left, &leaf_cells(3, 10)).unwrap();
        let right_cells: Vec<Vec<u8>> = (3..6)
            .map(|i| leaf_cell(format!("key{i:04}").as_bytes(), LeafValue::Inline(b"v")))
            .collect();
        fill_leaf(&mut right, &right_cells).unwrap();

        assert!(can_merge_leaves(&left, &right).unwrap());
        merge_leaves(&mut left, &right).unwrap();

        let node = LeafNodeRef::from_page(&left).unwrap();
        assert_eq!(node.cell_count(), 6);
        assert_eq!(node.key(5), b"key0005");
    }

    #[test]
    fn test_cannot_merge_full_leaves() {
        let mut left = leaf(1);
        let mut right = leaf(2);
        fill_leaf(&mut left, &leaf_cells(3, 900)).unwrap();
        fill_leaf(&mut right, &leaf_cells(3, 900)).unwrap();
        assert!(!can_merge_leaves(&left, &right).unwrap());
    }

    #[test]
    fn test_can_merge_with_empty_sibling() {
        let mut left = leaf(1);
        fill_leaf(&mut left, &leaf_cells(4, 900)).unwrap();
        assert!(can_merge_leaves(&left, &leaf(2)).unwrap());
    }

    #[test]
    fn test_merge_branches_pulls_separator_down() {
        let mut left = branch(1);
        let mut right = branch(2);
        fill_branch(&mut left, &[branch_cell(b"b", 10)], 11).unwrap();
        fill_branch(&mut right, &[branch_cell(b"y", 20)], 21).unwrap();

        assert!(can_merge_branches(&left, &right, b"m").unwrap());
        merge_branches(&mut left, &right, b"m").unwrap();

        let node = BranchNodeRef::from_page(&left).unwrap();
        assert_eq!(node.cell_count(), 3);
        assert_eq!(node.key(1), b"m");
        assert_eq!(node.child(0), 10);
        assert_eq!(node.child(1), 11);
        assert_eq!(node.child(2), 20);
        assert_eq!(node.rightmost_child(), 21);
    }

    #[test]
    fn test_fill_factor() {
        let empty = leaf(1);
        assert_eq!(leaf_fill_factor(&empty).unwrap(), 0.0);

        let mut full = leaf(2);
        fill_leaf(&mut full, &leaf_cells(4, 990)).unwrap();
        assert!(leaf_fill_factor(&full).unwrap() > 0.9);
        assert!(branch_fill_factor(&branch(3)).unwrap() < UNDERFLOW_FILL);
    }
}
