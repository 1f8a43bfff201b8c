//! burrow-store: an embedded, transactional key-value store.
//!
//! Keys and values are byte strings kept in a single copy-on-write B+ tree
//! inside one file:
//!
//! - **Snapshot reads**: readers see the committed state they started on, without locks
//! - **Single writer**: one write transaction at a time, with a configurable wait policy
//! - **Shadow paging**: modified pages are copied, never overwritten in place (no WAL)
//! - **Dual meta slots**: a commit becomes durable with one checksummed slot write
//! - **Checksummed pages**: XXH3 on every page, verified on read
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                Database API                 │
//! │   (open, get, put, delete, compact, verify) │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │             Transaction Layer               │
//! │ (ReadTransaction: snapshot, WriteTransaction│
//! │   : page overlay + commit, pending frees)   │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │               B+ Tree Layer                 │
//! │   (search, insert, delete, cursor, COW)     │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │                Page Layer                   │
//! │  (allocator, cache, checksum, free list)    │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │              Storage Backend                │
//! │      (FileBackend / InMemoryBackend)        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use burrow_store::{CursorOp, Database};
//!
//! let db = Database::open_in_memory()?;
//!
//! let mut txn = db.write()?;
//! txn.put(b"key", b"value")?;
//! txn.commit()?;
//!
//! let txn = db.read()?;
//! let mut cursor = txn.cursor();
//! let (key, value) = cursor.get(CursorOp::First)?;
//! assert_eq!(key, b"key");
//! assert_eq!(value, b"value");
//! # Ok::<(), burrow_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod backend;
pub mod btree;
pub mod compact;
pub mod db;
pub mod error;
pub mod freelist;
pub mod integrity;
pub mod page;
pub mod transaction;
pub mod types;

// Re-export commonly used types
pub use backend::{
    DEFAULT_FILE_MODE, DEFAULT_PAGE_SIZE, FileBackend, InMemoryBackend, MAGIC, MAX_PAGE_SIZE,
    MIN_PAGE_SIZE, MetaSlot, StorageBackend,
};
pub use btree::{
    BTree, PageProvider, PageSource,
    cursor::{Cursor, CursorOp, Iter},
};
pub use compact::CompactionStats;
pub use db::{
    Database, DatabaseConfig, DatabaseStats, ReadTransaction, SnapshotPages, TxnPages,
    WriteTransaction, WriterWait,
};
pub use error::{Error, PageId, PageType, Result};
pub use integrity::{IntegrityScrubber, ScrubError, ScrubResult};
pub use page::{PAGE_HEADER_SIZE, Page, PageAllocator, PageCache};
pub use types::{KeyOrder, OpenFlags, PutFlags};

/// Store format version.
pub const VERSION: u16 = backend::FORMAT_VERSION;
