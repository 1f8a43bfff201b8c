//! Snapshot bookkeeping for copy-on-write transactions.
//!
//! A read transaction pins the committed state it started on. Pages that a
//! later commit vacates stay allocated until every snapshot that could still
//! reach them has closed:
//!
//! ```text
//! commit t vacates {p, q}  ──►  PendingFrees[t] = {p, q}
//!                                     │
//!          oldest live snapshot > t   │   (or no readers at all)
//!                                     ▼
//!                           PageAllocator pool ──► reused by a later writer
//! ```

use std::{collections::BTreeMap, sync::Arc};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::{
    error::{Error, PageId, Result},
    types::KeyOrder,
};

/// The state published by the last successful commit.
///
/// Readers hold an `Arc` to it for their whole lifetime, writers start from
/// it, and a commit replaces it atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedState {
    /// Transaction that produced this state (0 for a fresh file).
    pub txn_id: u64,
    /// Root page of the tree, 0 when empty.
    pub root: PageId,
    /// Key comparator of the tree.
    pub order: KeyOrder,
    /// Number of live key/value pairs.
    pub entries: u64,
}

impl CommittedState {
    /// Whether the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.root == 0
    }
}

/// Tracks the snapshots pinned by open read transactions.
///
/// Registration happens under the same lock that reads the committed state,
/// so a writer computing [`oldest`](Self::oldest) never misses a reader that
/// has already picked its snapshot.
#[derive(Default)]
pub struct TransactionTracker {
    /// Snapshot transaction id to number of readers holding it.
    readers: Mutex<BTreeMap<u64, usize>>,
}

impl TransactionTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the current committed state for a new reader.
    pub fn begin_read(&self, state: &ArcSwap<CommittedState>) -> Arc<CommittedState> {
        let mut readers = self.readers.lock();
        let snapshot = state.load_full();
        *readers.entry(snapshot.txn_id).or_insert(0) += 1;
        snapshot
    }

    /// Releases a reader's snapshot.
    pub fn end_read(&self, txn_id: u64) {
        let mut readers = self.readers.lock();
        if let Some(count) = readers.get_mut(&txn_id) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&txn_id);
            }
        }
    }

    /// Oldest snapshot still held by a reader.
    pub fn oldest(&self) -> Option<u64> {
        self.readers.lock().keys().next().copied()
    }

    /// Number of open read transactions.
    pub fn active_readers(&self) -> usize {
        self.readers.lock().values().sum()
    }

    /// Runs `f` while no reader is open and none can start.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadersActive`] if a read transaction is open, or
    /// whatever `f` returns.
    pub fn exclusive<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let readers = self.readers.lock();
        let count: usize = readers.values().sum();
        if count > 0 {
            return Err(Error::ReadersActive { count });
        }
        f()
    }
}

/// Pages vacated by committed transactions, waiting for their readers to close.
#[derive(Debug, Default)]
pub struct PendingFrees {
    by_txn: BTreeMap<u64, Vec<PageId>>,
}

impl PendingFrees {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the pages vacated by commit `txn_id`.
    pub fn record(&mut self, txn_id: u64, pages: Vec<PageId>) {
        if !pages.is_empty() {
            self.by_txn.entry(txn_id).or_default().extend(pages);
        }
    }

    /// Removes and returns every page no snapshot can still reach.
    ///
    /// Pages vacated by `t` are released once the oldest reader's snapshot is
    /// newer than `t`, or when there are no readers.
    pub fn drain_freeable(&mut self, oldest_reader: Option<u64>) -> Vec<PageId> {
        let kept = match oldest_reader {
            Some(oldest) => self.by_txn.split_off(&oldest),
            None => BTreeMap::new(),
        };
        let freeable = std::mem::replace(&mut self.by_txn, kept);
        freeable.into_values().flatten().collect()
    }

    /// Every pending page with the transaction that vacated it.
    pub fn entries(&self) -> Vec<(u64, PageId)> {
        self.by_txn
            .iter()
            .flat_map(|(&txn_id, pages)| pages.iter().map(move |&page_id| (txn_id, page_id)))
            .collect()
    }

    /// Number of pending pages.
    pub fn len(&self) -> usize {
        self.by_txn.values().map(Vec::len).sum()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.by_txn.is_empty()
    }

    /// Drops every pending page.
    pub fn clear(&mut self) {
        self.by_txn.clear();
    }
}
