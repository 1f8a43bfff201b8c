//! B-tree cursor for iteration and range scans.
//!
//! The cursor keeps the path from the root to its current leaf, so stepping
//! to a neighbouring entry only reads the pages it moves onto. It borrows
//! the page source it was opened on, which ties its lifetime to the
//! transaction that owns the snapshot.

use std::sync::Arc;

use super::{
    MAX_DEPTH, PageSource,
    node::{BranchNodeRef, LeafNodeRef, SearchResult},
    overflow::load_value,
};
use crate::{
    error::{Error, PageId, PageType, Result},
    page::Page,
    types::KeyOrder,
};

/// Positioning operation for [`Cursor::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp<'k> {
    /// First entry in comparator order.
    First,
    /// Last entry in comparator order.
    Last,
    /// Entry after the current one; `First` when unpositioned.
    Next,
    /// Entry before the current one; `Last` when unpositioned.
    Prev,
    /// Smallest entry at or after the key in comparator order.
    Seek(&'k [u8]),
}

#[derive(Clone, Copy)]
enum Edge {
    First,
    Last,
}

/// One level of the root-to-leaf path.
#[derive(Clone)]
struct Frame {
    page: Arc<Page>,
    /// Child position in a branch (`cell_count()` = rightmost), entry index in a leaf.
    index: usize,
}

impl Frame {
    /// Number of positions at this level: children for a branch, entries for a leaf.
    fn positions(&self) -> usize {
        let count = self.page.item_count() as usize;
        if self.is_leaf() { count } else { count + 1 }
    }

    fn is_leaf(&self) -> bool {
        self.page.data[0] == PageType::BTreeLeaf as u8
    }
}

/// Cursor over one snapshot of a tree.
pub struct Cursor<'t, S: PageSource + ?Sized> {
    source: &'t S,
    root: PageId,
    order: KeyOrder,
    stack: Vec<Frame>,
}

impl<'t, S: PageSource + ?Sized> Cursor<'t, S> {
    /// Opens an unpositioned cursor on the tree rooted at `root`.
    pub fn new(source: &'t S, root: PageId, order: KeyOrder) -> Self {
        Self { source, root, order, stack: Vec::new() }
    }

    /// Applies `op` and returns the entry the cursor lands on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchPosition`] when there is no entry in the
    /// requested direction. `Next` and `Prev` leave the cursor where it was;
    /// a failed `First`, `Last` or `Seek` leaves it unpositioned.
    pub fn get(&mut self, op: CursorOp<'_>) -> Result<(Vec<u8>, Vec<u8>)> {
        match op {
            CursorOp::First => self.first(),
            CursorOp::Last => self.last(),
            CursorOp::Next => self.next(),
            CursorOp::Prev => self.prev(),
            CursorOp::Seek(key) => self.seek(key),
        }
    }

    /// Moves to the first entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchPosition`] on an empty tree.
    pub fn first(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        self.jump(Edge::First)
    }

    /// Moves to the last entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchPosition`] on an empty tree.
    pub fn last(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        self.jump(Edge::Last)
    }

    /// Moves to the next entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchPosition`] past the last entry.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        if !self.is_positioned() {
            return self.first();
        }
        if let Some(leaf) = self.stack.last_mut() {
            if leaf.index + 1 < leaf.positions() {
                leaf.index += 1;
                return self.current();
            }
        }
        if self.step_leaf(Edge::First)? { self.current() } else { Err(Error::NoSuchPosition) }
    }

    /// Moves to the previous entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchPosition`] before the first entry.
    pub fn prev(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        if !self.is_positioned() {
            return self.last();
        }
        if let Some(leaf) = self.stack.last_mut() {
            if leaf.index > 0 {
                leaf.index -= 1;
                return self.current();
            }
        }
        if self.step_leaf(Edge::Last)? { self.current() } else { Err(Error::NoSuchPosition) }
    }

    /// Moves to the smallest entry at or after `key` in comparator order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchPosition`] if every key sorts before `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        self.stack.clear();
        if self.root == 0 {
            return Err(Error::NoSuchPosition);
        }

        let mut page_id = self.root;
        loop {
            self.check_depth()?;
            let page = Arc::new(self.source.read_page(page_id)?);
            match page.page_type()? {
                PageType::BTreeLeaf => {
                    let index = match LeafNodeRef::from_page(&page)?.search(key, self.order) {
                        SearchResult::Found(idx) | SearchResult::NotFound(idx) => idx,
                    };
                    self.stack.push(Frame { page, index });
                    break;
                },
                PageType::BTreeBranch => {
                    let (index, child) = {
                        let node = BranchNodeRef::from_page(&page)?;
                        let index = node.child_index(key, self.order);
                        (index, node.child_at(index))
                    };
                    self.stack.push(Frame { page, index });
                    page_id = child;
                },
                found => {
                    return Err(Error::PageTypeMismatch { expected: PageType::BTreeLeaf, found });
                },
            }
        }

        if self.is_positioned() || self.step_leaf(Edge::First)? {
            self.current()
        } else {
            self.stack.clear();
            Err(Error::NoSuchPosition)
        }
    }

    /// Returns the entry under the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchPosition`] if the cursor is unpositioned.
    pub fn current(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let frame = self.stack.last().ok_or(Error::NoSuchPosition)?;
        let leaf = LeafNodeRef::from_page(&frame.page)?;
        if frame.index >= leaf.cell_count() {
            return Err(Error::NoSuchPosition);
        }
        let value = load_value(self.source, leaf.value(frame.index))?;
        Ok((leaf.key(frame.index).to_vec(), value))
    }

    /// Key under the cursor, without loading the value.
    pub fn key(&self) -> Option<&[u8]> {
        let frame = self.stack.last()?;
        let leaf = LeafNodeRef::from_page(&frame.page).ok()?;
        (frame.index < leaf.cell_count()).then(|| leaf.key(frame.index))
    }

    /// Whether the cursor sits on an entry.
    pub fn is_positioned(&self) -> bool {
        self.stack.last().is_some_and(|leaf| leaf.is_leaf() && leaf.index < leaf.positions())
    }

    /// Comparator the cursor walks the tree with.
    pub fn order(&self) -> KeyOrder {
        self.order
    }

    fn check_depth(&self) -> Result<()> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(Error::Corrupted {
                reason: format!("Tree deeper than {MAX_DEPTH} levels under root {}", self.root),
            });
        }
        Ok(())
    }

    fn jump(&mut self, edge: Edge) -> Result<(Vec<u8>, Vec<u8>)> {
        self.stack.clear();
        if self.root == 0 {
            return Err(Error::NoSuchPosition);
        }
        self.descend(self.root, edge)?;
        if self.is_positioned() || self.step_leaf(edge)? {
            self.current()
        } else {
            self.stack.clear();
            Err(Error::NoSuchPosition)
        }
    }

    /// Pushes frames from `page_id` down to a leaf along the `edge` side.
    fn descend(&mut self, mut page_id: PageId, edge: Edge) -> Result<()> {
        loop {
            self.check_depth()?;
            let page = Arc::new(self.source.read_page(page_id)?);
            match page.page_type()? {
                PageType::BTreeLeaf => {
                    let count = LeafNodeRef::from_page(&page)?.cell_count();
                    let index = match edge {
                        Edge::First => 0,
                        Edge::Last => count.saturating_sub(1),
                    };
                    self.stack.push(Frame { page, index });
                    return Ok(());
                },
                PageType::BTreeBranch => {
                    let (index, child) = {
                        let node = BranchNodeRef::from_page(&page)?;
                        let index = match edge {
                            Edge::First => 0,
                            Edge::Last => node.cell_count(),
                        };
                        (index, node.child_at(index))
                    };
                    self.stack.push(Frame { page, index });
                    page_id = child;
                },
                found => {
                    return Err(Error::PageTypeMismatch { expected: PageType::BTreeLeaf, found });
                },
            }
        }
    }

    /// Moves to the nearest non-empty leaf after (`Edge::First`) or before
    /// (`Edge::Last`) the current one. Returns `false` and leaves the
    /// cursor untouched if there is none.
    fn step_leaf(&mut self, edge: Edge) -> Result<bool> {
        let saved = self.stack.clone();
        loop {
            let leaf_level = self.stack.len().saturating_sub(1);
            let level = (0..leaf_level).rev().find(|&level| {
                let frame = &self.stack[level];
                match edge {
                    Edge::First => frame.index + 1 < frame.positions(),
                    Edge::Last => frame.index > 0,
                }
            });
            let Some(level) = level else {
                self.stack = saved;
                return Ok(false);
            };

            self.stack.truncate(level + 1);
            let child = {
                let frame = &mut self.stack[level];
                match edge {
                    Edge::First => frame.index += 1,
                    Edge::Last => frame.index -= 1,
                }
                BranchNodeRef::from_page(&frame.page)?.child_at(frame.index)
            };
            self.descend(child, edge)?;
            if self.is_positioned() {
                return Ok(true);
            }
        }
    }
}

/// Iterator over a cursor with optional half-open bounds `[start, end)` in
/// comparator order.
pub struct Iter<'t, S: PageSource + ?Sized> {
    cursor: Cursor<'t, S>,
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    started: bool,
    done: bool,
}

impl<'t, S: PageSource + ?Sized> Iter<'t, S> {
    /// Wraps `cursor`; the cursor is repositioned on the first call to `next`.
    pub fn new(cursor: Cursor<'t, S>, start: Option<&[u8]>, end: Option<&[u8]>) -> Self {
        Self {
            cursor,
            start: start.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
            started: false,
            done: false,
        }
    }
}

impl<S: PageSource + ?Sized> Iterator for Iter<'_, S> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = if self.started {
            self.cursor.next()
        } else {
            self.started = true;
            match &self.start {
                Some(start) => self.cursor.seek(start),
                None => self.cursor.first(),
            }
        };
        match step {
            Ok((key, value)) => {
                let order = self.cursor.order();
                if self.end.as_deref().is_some_and(|end| order.compare(&key, end).is_ge()) {
                    self.done = true;
                    return None;
                }
                Some(Ok((key, value)))
            },
            Err(Error::NoSuchPosition) => {
                self.done = true;
                None
            },
            Err(e) => {
                self.done = true;
                Some(Err(e))
            },
        }
    }
}
