//! Database handle and transactions.
//!
//! One writer and any number of readers share a [`Database`]. Readers pin
//! the committed state they started on and never take a lock that a writer
//! holds for long; the writer builds a private overlay of copied pages and
//! publishes it in one atomic swap at commit.
//!
//! # Example
//!
//! ```no_run
//! use burrow_store::Database;
//!
//! let db = Database::open("data.burrow")?;
//!
//! {
//!     let mut txn = db.write()?;
//!     txn.put(b"apple", b"red")?;
//!     txn.put(b"banana", b"yellow")?;
//!     txn.commit()?;
//! }
//!
//! {
//!     let txn = db.read()?;
//!     assert_eq!(txn.get(b"apple")?, Some(b"red".to_vec()));
//!     for entry in txn.iter() {
//!         let (key, value) = entry?;
//!         println!("{key:?} => {value:?}");
//!     }
//! }
//! # Ok::<(), burrow_store::Error>(())
//! ```

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::{
    backend::{
        DEFAULT_FILE_MODE, DEFAULT_PAGE_SIZE, FileBackend, InMemoryBackend, MetaSlot,
        StorageBackend, validate_page_size,
    },
    btree::{
        BTree, InsertOutcome, MAX_DEPTH, PageProvider, PageSource, check_key,
        cursor::{Cursor, Iter},
        node::{BranchNodeRef, LeafNodeRef, LeafValue},
        overflow::overflow_pages,
        search,
    },
    error::{Error, PageId, PageType, Result},
    freelist::{self, FreeEntry},
    page::{Page, PageAllocator, PageCache},
    transaction::{CommittedState, PendingFrees, TransactionTracker},
    types::{KeyOrder, OpenFlags, PutFlags},
};

/// How [`Database::write`] waits for a busy writer lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriterWait {
    /// Block until the active writer finishes.
    #[default]
    Block,
    /// Fail immediately with [`Error::WriterBusy`].
    FailFast,
    /// Wait up to the given duration, then fail with [`Error::WriterBusy`].
    Timeout(Duration),
}

/// Database configuration options.
#[derive(Debug, Clone, bon::Builder)]
pub struct DatabaseConfig {
    /// Page size for new files (power of two, 1 KiB to 32 KiB). Existing
    /// files keep the page size they were created with.
    #[builder(default = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,
    /// Maximum pages to cache in memory.
    #[builder(default = 1024)]
    pub cache_size: usize,
    /// Open flags (`NO_SYNC`, `READ_ONLY`, `REVERSE_KEY`).
    #[builder(default)]
    pub flags: OpenFlags,
    /// Writer lock policy for [`Database::write`].
    #[builder(default)]
    pub writer_wait: WriterWait,
    /// Upper bound on the file size in pages, including page 0.
    pub max_pages: Option<u64>,
    /// Permission bits for a newly created file.
    #[builder(default = DEFAULT_FILE_MODE)]
    pub file_mode: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: 1024, // 4 MiB with 4 KiB pages
            flags: OpenFlags::empty(),
            writer_wait: WriterWait::Block,
            max_pages: None,
            file_mode: DEFAULT_FILE_MODE,
        }
    }
}

impl DatabaseConfig {
    /// Checks the configuration before any file is touched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an unsupported page size, an
    /// empty cache, or a page limit that leaves no room for data.
    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if self.cache_size == 0 {
            return Err(Error::InvalidConfig { reason: "cache_size must be at least 1".into() });
        }
        if let Some(limit) = self.max_pages {
            if limit < 2 {
                return Err(Error::InvalidConfig {
                    reason: format!("max_pages {limit} leaves no room for data pages"),
                });
            }
        }
        Ok(())
    }
}

/// State owned by whoever holds the writer lock.
#[derive(Debug, Default)]
pub(crate) struct WriterState {
    /// Pages holding the free list referenced by the active meta slot.
    pub(crate) free_list_chain: Vec<PageId>,
}

/// The main database handle.
///
/// Generic over [`StorageBackend`]: use [`Database<FileBackend>`] for
/// on-disk databases and [`Database<InMemoryBackend>`] for tests.
///
/// # Copy-on-write and snapshots
///
/// - A read transaction captures the committed state at begin and holds no
///   lock afterwards.
/// - A write transaction copies every page it changes to a page number no
///   snapshot can see, so readers are never disturbed.
/// - Commit publishes the new state with a single atomic pointer swap.
/// - Pages replaced by a commit are reused only after every reader that
///   could reach them has finished.
pub struct Database<B: StorageBackend> {
    /// Storage backend (file or memory).
    pub(crate) backend: RwLock<B>,
    /// Committed pages shared by all transactions.
    pub(crate) cache: PageCache,
    /// Page allocator for the writer.
    pub(crate) allocator: PageAllocator,
    /// Current committed state, swapped atomically on commit.
    pub(crate) committed: ArcSwap<CommittedState>,
    /// Snapshots held by open readers.
    pub(crate) tracker: TransactionTracker,
    /// Pages vacated by commits that readers may still reach.
    pub(crate) pending_frees: Mutex<PendingFrees>,
    /// Writer lock. At most one write transaction (or compaction) holds it.
    pub(crate) writer: Mutex<WriterState>,
    pub(crate) config: DatabaseConfig,
    pub(crate) page_size: usize,
    /// Total B-tree page splits since the handle was opened.
    page_splits: AtomicU64,
    /// Total B-tree node merges since the handle was opened.
    page_merges: AtomicU64,
}

impl Database<FileBackend> {
    /// Opens the database at `path` with default configuration, creating
    /// the file if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened, created or read.
    /// Returns [`Error::Corrupted`] if the file is too short or both meta slots are invalid.
    /// Returns [`Error::Locked`] if another handle has the file open for writing.
    ///
    /// ```no_run
    /// use burrow_store::Database;
    ///
    /// let db = Database::open("/var/lib/app/state.burrow")?;
    /// db.put(b"key", b"value")?;
    /// # Ok::<(), burrow_store::Error>(())
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, DatabaseConfig::default())
    }

    /// Opens the database at `path` with custom configuration.
    ///
    /// A missing file is created with `config.page_size` and
    /// `config.file_mode`, unless `READ_ONLY` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is rejected.
    /// Returns [`Error::Io`] if the file cannot be opened, created or read.
    /// Returns [`Error::Corrupted`] if the file is too short or both meta slots are invalid.
    /// Returns [`Error::Locked`] if another handle holds a conflicting lock.
    ///
    /// ```no_run
    /// use burrow_store::{Database, DatabaseConfig, OpenFlags};
    ///
    /// let config = DatabaseConfig::builder()
    ///     .flags(OpenFlags::NO_SYNC | OpenFlags::REVERSE_KEY)
    ///     .page_size(8192)
    ///     .build();
    /// let db = Database::open_with_config("scratch.burrow", config)?;
    /// # Ok::<(), burrow_store::Error>(())
    /// ```
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        let read_only = config.flags.contains(OpenFlags::READ_ONLY);

        let backend = if read_only || path.exists() {
            FileBackend::open(path, read_only)?
        } else {
            let initial = MetaSlot::new(config.page_size, config.flags.key_order());
            tracing::info!(path = %path.display(), page_size = config.page_size, "Creating database file");
            FileBackend::create(path, &initial, config.file_mode)?
        };
        Self::from_backend(backend, config)
    }
}

impl Database<InMemoryBackend> {
    /// Creates a new in-memory database.
    ///
    /// Useful for testing and ephemeral workloads. Data is lost on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if backend initialization fails.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_config(DatabaseConfig::default())
    }

    /// Creates a new in-memory database with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is rejected.
    pub fn open_in_memory_with_config(config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let backend = InMemoryBackend::with_page_size(config.page_size)?;
        Self::from_backend(backend, config)
    }
}

impl<B: StorageBackend> Database<B> {
    /// Opens a database on a backend whose meta slots are already written.
    ///
    /// The page size comes from the stored meta slot; `config.page_size`
    /// only applies when a file is created.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if both meta slots are invalid or the
    /// stored page size disagrees with the backend, or any read error.
    pub fn from_backend(backend: B, config: DatabaseConfig) -> Result<Self> {
        let meta = Self::load_meta(&backend)?;
        let page_size = meta.page_size as usize;
        if page_size != backend.page_size() {
            return Err(Error::Corrupted {
                reason: format!(
                    "Meta page size {page_size} does not match backend page size {}",
                    backend.page_size()
                ),
            });
        }
        if page_size != config.page_size {
            tracing::debug!(
                file_page_size = page_size,
                configured = config.page_size,
                "Using the page size stored in the file"
            );
        }

        let order = Self::resolve_order(&meta, config.flags);
        let state = CommittedState {
            txn_id: meta.txn_id,
            root: meta.root,
            order,
            entries: meta.entries,
        };

        let db = Self {
            backend: RwLock::new(backend),
            cache: PageCache::new(config.cache_size),
            allocator: PageAllocator::new(page_size, meta.total_pages, config.max_pages),
            committed: ArcSwap::from_pointee(state),
            tracker: TransactionTracker::new(),
            pending_frees: Mutex::new(PendingFrees::new()),
            writer: Mutex::new(WriterState::default()),
            config,
            page_size,
            page_splits: AtomicU64::new(0),
            page_merges: AtomicU64::new(0),
        };
        db.restore_free_list(&meta)?;

        tracing::info!(
            txn_id = meta.txn_id,
            entries = meta.entries,
            total_pages = meta.total_pages,
            page_size,
            order = ?order,
            free_pages = db.allocator.free_page_count(),
            "Opened database"
        );
        Ok(db)
    }

    /// Reads both meta slots and picks the active one.
    fn load_meta(backend: &B) -> Result<MetaSlot> {
        let slot0 = backend.read_meta(0)?;
        let slot1 = backend.read_meta(1)?;
        let (meta, _) = MetaSlot::select(&slot0, &slot1)?;
        Ok(meta)
    }

    /// The comparator is fixed once the tree holds data; until then the
    /// open flags choose it.
    fn resolve_order(meta: &MetaSlot, flags: OpenFlags) -> KeyOrder {
        let requested = flags.key_order();
        if meta.root == 0 {
            return requested;
        }
        if flags.contains(OpenFlags::REVERSE_KEY) && meta.order != KeyOrder::Reverse {
            tracing::warn!(
                stored = ?meta.order,
                requested = ?requested,
                "Ignoring REVERSE_KEY for a non-empty tree"
            );
        }
        meta.order
    }

    /// Loads the persisted free list into the allocator, rebuilding it from
    /// the reachable pages if the chain cannot be read.
    fn restore_free_list(&self, meta: &MetaSlot) -> Result<()> {
        let source = SnapshotPages { db: self };
        let (chain, free) = match freelist::read_chain(&source, meta.free_list_head, meta.total_pages)
        {
            Ok(loaded) => {
                (loaded.chain, loaded.entries.into_iter().map(|entry| entry.page_id).collect())
            },
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    head = meta.free_list_head,
                    "Free list unreadable, rebuilding from reachable pages"
                );
                let reachable = self.collect_reachable_pages(meta.root)?;
                let free: Vec<PageId> =
                    (1..meta.total_pages).filter(|page_id| !reachable.contains(page_id)).collect();
                (Vec::new(), free)
            },
        };

        self.allocator.reset(meta.total_pages, free);
        self.writer.lock().free_list_chain = chain;
        Ok(())
    }

    /// Collects every page reachable from `root`: branches, leaves and
    /// overflow chains.
    pub(crate) fn collect_reachable_pages(&self, root: PageId) -> Result<HashSet<PageId>> {
        let mut reachable = HashSet::new();
        if root == 0 {
            return Ok(reachable);
        }

        let source = SnapshotPages { db: self };
        let mut stack = vec![(root, 1usize)];
        while let Some((page_id, depth)) = stack.pop() {
            if depth > MAX_DEPTH || !reachable.insert(page_id) {
                return Err(Error::Corrupted {
                    reason: format!("Page {page_id} reached twice or deeper than {MAX_DEPTH}"),
                });
            }
            let page = self.read_page(page_id)?;
            match page.page_type()? {
                PageType::BTreeLeaf => {
                    let leaf = LeafNodeRef::from_page(&page)?;
                    for idx in 0..leaf.cell_count() {
                        if let LeafValue::Overflow { head, len } = leaf.value(idx) {
                            reachable.extend(overflow_pages(&source, head, len as usize)?);
                        }
                    }
                },
                PageType::BTreeBranch => {
                    let branch = BranchNodeRef::from_page(&page)?;
                    for idx in 0..=branch.cell_count() {
                        stack.push((branch.child_at(idx), depth + 1));
                    }
                },
                found => {
                    return Err(Error::PageTypeMismatch { expected: PageType::BTreeBranch, found });
                },
            }
        }
        Ok(reachable)
    }

    /// Begins a read-only transaction on the latest committed state.
    ///
    /// Never blocks on the writer. The transaction keeps seeing the same
    /// state until it is dropped.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for backends that
    /// need to validate the snapshot.
    pub fn read(&self) -> Result<ReadTransaction<'_, B>> {
        let state = self.tracker.begin_read(&self.committed);
        Ok(ReadTransaction { pages: SnapshotPages { db: self }, state })
    }

    /// Begins a write transaction, waiting for the writer lock according
    /// to [`DatabaseConfig::writer_wait`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] on a read-only handle.
    /// Returns [`Error::WriterBusy`] if the lock is not acquired under the
    /// configured policy.
    pub fn write(&self) -> Result<WriteTransaction<'_, B>> {
        self.begin_write(self.config.writer_wait)
    }

    /// Begins a write transaction, failing at once if another is active.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] on a read-only handle.
    /// Returns [`Error::WriterBusy`] if another write transaction is active.
    pub fn try_write(&self) -> Result<WriteTransaction<'_, B>> {
        self.begin_write(WriterWait::FailFast)
    }

    fn begin_write(&self, wait: WriterWait) -> Result<WriteTransaction<'_, B>> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        let writer = match wait {
            WriterWait::Block => self.writer.lock(),
            WriterWait::FailFast => self.writer.try_lock().ok_or(Error::WriterBusy)?,
            WriterWait::Timeout(timeout) => {
                self.writer.try_lock_for(timeout).ok_or(Error::WriterBusy)?
            },
        };

        self.release_pending_frees();

        let base = self.committed.load_full();
        Ok(WriteTransaction {
            db: self,
            pages: TxnPages::new(self, base.txn_id + 1),
            root: base.root,
            order: base.order,
            entries: base.entries,
            finished: false,
            writer,
        })
    }

    /// Moves vacated pages that no reader can reach into the allocator pool.
    fn release_pending_frees(&self) {
        let oldest = self.tracker.oldest();
        let freed = self.pending_frees.lock().drain_freeable(oldest);
        if freed.is_empty() {
            return;
        }
        for &page_id in &freed {
            self.cache.remove(page_id);
        }
        tracing::debug!(pages = freed.len(), oldest_reader = ?oldest, "Released vacated pages");
        self.allocator.free_batch(&freed);
    }

    /// Returns the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the key is absent, or a read error.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.read()?.get(key)?.ok_or(Error::NotFound)
    }

    /// Stores `value` under `key` in its own transaction, replacing any
    /// existing value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyKey`] or [`Error::KeyTooLarge`] for a bad key,
    /// or any write or commit error.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with(key, value, PutFlags::empty())
    }

    /// Stores `value` under `key` in its own transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyExists`] if `flags` has `NO_OVERWRITE` and the
    /// key is present, plus everything [`put`](Self::put) returns.
    pub fn put_with(&self, key: &[u8], value: &[u8], flags: PutFlags) -> Result<()> {
        check_key(key, self.page_size)?;
        let mut txn = self.write()?;
        txn.put_with(key, value, flags)?;
        txn.commit()
    }

    /// Removes `key` in its own transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the key is absent,
    /// [`Error::EmptyKey`] for an empty key, or any write or commit error.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let mut txn = self.write()?;
        txn.delete(key)?;
        txn.commit()
    }

    /// Forces all committed data to durable storage.
    ///
    /// Only needed under `NO_SYNC`; normal commits are already durable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the sync fails.
    pub fn sync(&self) -> Result<()> {
        if self.is_read_only() {
            return Ok(());
        }
        self.backend.read().sync()
    }

    /// Closes the handle, syncing outstanding writes first.
    ///
    /// Dropping the handle releases it too, but without the final sync.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the final sync fails.
    pub fn close(self) -> Result<()> {
        self.sync()?;
        let state = self.committed.load_full();
        tracing::info!(txn_id = state.txn_id, entries = state.entries, "Closed database");
        Ok(())
    }

    /// Returns database statistics.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the backend size cannot be read.
    pub fn stats(&self) -> Result<DatabaseStats> {
        let cache = self.cache.stats();
        let state = self.committed.load_full();
        Ok(DatabaseStats {
            page_size: self.page_size,
            txn_id: state.txn_id,
            entries: state.entries,
            total_pages: self.allocator.next_page_id(),
            free_pages: self.allocator.free_page_count(),
            pending_free_pages: self.pending_frees.lock().len(),
            active_readers: self.tracker.active_readers(),
            file_size: self.backend.read().file_size()?,
            cached_pages: cache.size,
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            page_splits: self.page_splits.load(Ordering::Relaxed),
            page_merges: self.page_merges.load(Ordering::Relaxed),
        })
    }

    /// Returns the page size of the open file.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the comparator of the tree.
    pub fn key_order(&self) -> KeyOrder {
        self.committed.load().order
    }

    /// Returns the configuration the handle was opened with.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Whether the handle was opened with `READ_ONLY`.
    pub fn is_read_only(&self) -> bool {
        self.config.flags.contains(OpenFlags::READ_ONLY)
    }

    fn syncs_on_commit(&self) -> bool {
        !self.config.flags.contains(OpenFlags::NO_SYNC)
    }

    /// Reads a committed page from cache or backend, verifying it on a miss.
    pub(crate) fn read_page(&self, page_id: PageId) -> Result<Page> {
        if page_id == 0 {
            return Err(Error::PageNotFound { page_id });
        }
        if let Some(page) = self.cache.get(page_id) {
            return Ok(page);
        }

        let data = self.backend.read().read_page(page_id)?;
        let page = Page::from_bytes(page_id, data);
        page.verify()?;
        self.cache.insert(page.clone());
        Ok(page)
    }
}

/// Database statistics.
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    /// Page size in bytes.
    pub page_size: usize,
    /// Last committed transaction.
    pub txn_id: u64,
    /// Live key/value pairs.
    pub entries: u64,
    /// Page slots in the file, including page 0.
    pub total_pages: PageId,
    /// Pages ready for reuse.
    pub free_pages: usize,
    /// Vacated pages waiting for readers to finish.
    pub pending_free_pages: usize,
    /// Open read transactions.
    pub active_readers: usize,
    /// Size of the backing storage in bytes.
    pub file_size: u64,
    /// Pages currently in cache.
    pub cached_pages: usize,
    /// Total page cache hits since open.
    pub cache_hits: u64,
    /// Total page cache misses since open.
    pub cache_misses: u64,
    /// Total B-tree page splits since open.
    pub page_splits: u64,
    /// Total B-tree node merges since open.
    pub page_merges: u64,
}

/// Committed pages as seen by a snapshot.
///
/// Committed pages never change while a snapshot can reach them, so the
/// shared cache serves every reader.
pub struct SnapshotPages<'db, B: StorageBackend> {
    db: &'db Database<B>,
}

impl<B: StorageBackend> PageSource for SnapshotPages<'_, B> {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        self.db.read_page(page_id)
    }

    fn page_size(&self) -> usize {
        self.db.page_size
    }
}

/// A read-only transaction.
///
/// Sees the committed state captured at begin, unaffected by later commits.
pub struct ReadTransaction<'db, B: StorageBackend> {
    pages: SnapshotPages<'db, B>,
    state: Arc<CommittedState>,
}

impl<'db, B: StorageBackend> ReadTransaction<'db, B> {
    /// Transaction id of the snapshot.
    pub fn txn_id(&self) -> u64 {
        self.state.txn_id
    }

    /// Number of entries in the snapshot.
    pub fn len(&self) -> u64 {
        self.state.entries
    }

    /// Whether the snapshot holds no entries.
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Comparator of the tree.
    pub fn order(&self) -> KeyOrder {
        self.state.order
    }

    /// Returns the value stored under `key`, or `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails during the lookup.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        search(&self.pages, self.state.root, self.state.order, key)
    }

    /// Checks if a key exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails during the lookup.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Opens an unpositioned cursor on the snapshot.
    pub fn cursor(&self) -> Cursor<'_, SnapshotPages<'db, B>> {
        Cursor::new(&self.pages, self.state.root, self.state.order)
    }

    /// Iterates over every entry in comparator order.
    pub fn iter(&self) -> Iter<'_, SnapshotPages<'db, B>> {
        Iter::new(self.cursor(), None, None)
    }

    /// Iterates over `[start, end)` in comparator order. `None` leaves that
    /// side open.
    pub fn range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Iter<'_, SnapshotPages<'db, B>> {
        Iter::new(self.cursor(), start, end)
    }

    /// Depth of the tree (0 when empty).
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails.
    pub fn depth(&self) -> Result<u32> {
        crate::btree::depth(&self.pages, self.state.root)
    }

    pub(crate) fn root(&self) -> PageId {
        self.state.root
    }
}

impl<B: StorageBackend> Drop for ReadTransaction<'_, B> {
    fn drop(&mut self) {
        self.pages.db.tracker.end_read(self.state.txn_id);
    }
}

/// Undo record for the mutation currently running in a write transaction.
#[derive(Default)]
struct OpUndo {
    /// Overlay entries as they were before the operation first touched them.
    overlay: HashMap<PageId, Option<Page>>,
    /// Pages allocated by the operation.
    allocated: Vec<PageId>,
    /// Transaction-owned pages the operation gave up. Returned to the pool
    /// only once the operation succeeds.
    released: Vec<PageId>,
    /// Length of the vacated list when the operation began.
    vacated_len: usize,
}

/// Page overlay of a write transaction.
///
/// Reads see the transaction's own writes first. Pages allocated by the
/// transaction are rewritten in place; everything else is copied by the
/// tree before it is modified. Each mutation runs between
/// [`begin_op`](Self::begin_op) and [`end_op`](Self::end_op); a failed
/// mutation is undone with [`rollback_op`](Self::rollback_op).
pub struct TxnPages<'db, B: StorageBackend> {
    db: &'db Database<B>,
    txn_id: u64,
    overlay: HashMap<PageId, Page>,
    /// Page numbers this transaction owns.
    allocated: HashSet<PageId>,
    /// Committed pages this transaction replaced or dropped.
    vacated: Vec<PageId>,
    op: Option<OpUndo>,
}

impl<'db, B: StorageBackend> TxnPages<'db, B> {
    fn new(db: &'db Database<B>, txn_id: u64) -> Self {
        Self {
            db,
            txn_id,
            overlay: HashMap::new(),
            allocated: HashSet::new(),
            vacated: Vec::new(),
            op: None,
        }
    }

    fn has_changes(&self) -> bool {
        !self.overlay.is_empty() || !self.vacated.is_empty()
    }

    fn allocate_id(&mut self) -> Result<PageId> {
        let page_id = self.db.allocator.allocate()?;
        self.allocated.insert(page_id);
        if let Some(op) = &mut self.op {
            op.allocated.push(page_id);
        }
        Ok(page_id)
    }

    fn begin_op(&mut self) {
        self.op = Some(OpUndo { vacated_len: self.vacated.len(), ..OpUndo::default() });
    }

    fn end_op(&mut self) {
        if let Some(op) = self.op.take() {
            self.db.allocator.free_batch(&op.released);
        }
    }

    fn rollback_op(&mut self) {
        let Some(op) = self.op.take() else {
            return;
        };
        for (page_id, prior) in op.overlay {
            match prior {
                Some(page) => self.overlay.insert(page_id, page),
                None => self.overlay.remove(&page_id),
            };
        }
        for page_id in &op.released {
            if !op.allocated.contains(page_id) {
                self.allocated.insert(*page_id);
            }
        }
        for page_id in op.allocated {
            self.allocated.remove(&page_id);
            self.db.allocator.free(page_id);
        }
        self.vacated.truncate(op.vacated_len);
    }

    /// Drops every change and returns the transaction's pages to the pool.
    fn discard(&mut self) {
        self.op = None;
        let owned: Vec<PageId> = self.allocated.drain().collect();
        self.db.allocator.free_batch(&owned);
        self.overlay.clear();
        self.vacated.clear();
    }

    /// Drops every change without reusing the transaction's pages.
    ///
    /// Used when a commit failed after touching the meta slot: the slot may
    /// already point at those pages.
    fn abandon(&mut self) {
        self.op = None;
        self.allocated.clear();
        self.overlay.clear();
        self.vacated.clear();
    }

    fn remember(&mut self, page_id: PageId, prior: Option<Page>) {
        if let Some(op) = &mut self.op {
            op.overlay.entry(page_id).or_insert(prior);
        }
    }
}

impl<B: StorageBackend> PageSource for TxnPages<'_, B> {
    fn read_page(&self, page_id: PageId) -> Result<Page> {
        if let Some(page) = self.overlay.get(&page_id) {
            return Ok(page.clone());
        }
        self.db.read_page(page_id)
    }

    fn page_size(&self) -> usize {
        self.db.page_size
    }
}

impl<B: StorageBackend> PageProvider for TxnPages<'_, B> {
    fn write_page(&mut self, mut page: Page) -> Result<()> {
        if !self.allocated.contains(&page.id) {
            return Err(Error::Corrupted {
                reason: format!("Page {} written without being allocated", page.id),
            });
        }
        page.seal(self.txn_id);
        let page_id = page.id;
        let prior = self.overlay.insert(page_id, page);
        self.remember(page_id, prior);
        Ok(())
    }

    fn allocate_page(&mut self, page_type: PageType) -> Result<Page> {
        let page_id = self.allocate_id()?;
        Ok(Page::new(page_id, self.db.page_size, page_type, self.txn_id))
    }

    fn free_page(&mut self, page_id: PageId) {
        if self.allocated.remove(&page_id) {
            // Never visible to a snapshot, so the number can be reused as
            // soon as the operation succeeds.
            let prior = self.overlay.remove(&page_id);
            self.remember(page_id, prior);
            match &mut self.op {
                Some(op) => op.released.push(page_id),
                None => self.db.allocator.free(page_id),
            }
        } else {
            self.vacated.push(page_id);
        }
    }

    fn is_writable(&self, page_id: PageId) -> bool {
        self.allocated.contains(&page_id)
    }

    fn txn_id(&self) -> u64 {
        self.txn_id
    }
}

/// A write transaction.
///
/// Changes live in a private page overlay until [`commit`](Self::commit).
/// Read transactions run concurrently and never see them.
///
/// # Invariants
///
/// **Single writer:** the transaction holds the writer lock from begin until
/// commit, abort or drop.
///
/// **Failed operations:** a `put` or `delete` that fails midway (for example
/// with [`Error::StorageExhausted`]) is undone before it returns, leaving the
/// transaction as it was before the call so the caller can retry or abort.
///
/// **Commit sequence:**
/// 1. Persist the free list: reusable pages, pages still pending for
///    readers, and the pages this transaction vacated.
/// 2. Write overlay and free-list pages, then sync unless `NO_SYNC`.
/// 3. Write the inactive meta slot, then sync unless `NO_SYNC`.
/// 4. Publish the new committed state and queue the vacated pages until
///    older readers finish.
///
/// **Drop behavior:** dropping without `commit()` aborts.
pub struct WriteTransaction<'db, B: StorageBackend> {
    db: &'db Database<B>,
    pages: TxnPages<'db, B>,
    root: PageId,
    order: KeyOrder,
    entries: u64,
    finished: bool,
    writer: MutexGuard<'db, WriterState>,
}

impl<'db, B: StorageBackend> WriteTransaction<'db, B> {
    /// Transaction id this transaction commits as.
    pub fn txn_id(&self) -> u64 {
        self.pages.txn_id
    }

    /// Number of entries including uncommitted changes.
    pub fn len(&self) -> u64 {
        self.entries
    }

    /// Whether the tree is empty including uncommitted changes.
    pub fn is_empty(&self) -> bool {
        self.root == 0
    }

    /// Comparator of the tree.
    pub fn order(&self) -> KeyOrder {
        self.order
    }

    /// Returns the value stored under `key`, including uncommitted changes.
    ///
    /// # Errors
    ///
    /// Returns an error if a page read fails during the lookup.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        search(&self.pages, self.root, self.order, key)
    }

    /// Stores `value` under `key`, replacing any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyKey`] or [`Error::KeyTooLarge`] for a bad key,
    /// [`Error::StorageExhausted`] when the page limit is reached, or any
    /// page read/write error.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with(key, value, PutFlags::empty())
    }

    /// Stores `value` under `key` with explicit flags.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyExists`] if `flags` has `NO_OVERWRITE` and the
    /// key is present, plus everything [`put`](Self::put) returns.
    pub fn put_with(&mut self, key: &[u8], value: &[u8], flags: PutFlags) -> Result<()> {
        if self.apply(|tree| tree.insert(key, value, flags))? == InsertOutcome::Inserted {
            self.entries += 1;
        }
        Ok(())
    }

    /// Removes `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the key is absent,
    /// [`Error::EmptyKey`] for an empty key, or any page read/write error.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        if !self.apply(|tree| tree.delete(key))? {
            return Err(Error::NotFound);
        }
        self.entries = self.entries.saturating_sub(1);
        Ok(())
    }

    /// Opens an unpositioned cursor that sees uncommitted changes.
    pub fn cursor(&self) -> Cursor<'_, TxnPages<'db, B>> {
        Cursor::new(&self.pages, self.root, self.order)
    }

    /// Iterates over every entry, including uncommitted changes.
    pub fn iter(&self) -> Iter<'_, TxnPages<'db, B>> {
        Iter::new(self.cursor(), None, None)
    }

    /// Iterates over `[start, end)` in comparator order.
    pub fn range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Iter<'_, TxnPages<'db, B>> {
        Iter::new(self.cursor(), start, end)
    }

    /// Runs one tree mutation, undoing its page changes if it fails.
    fn apply<T>(
        &mut self,
        op: impl FnOnce(&mut BTree<&mut TxnPages<'db, B>>) -> Result<T>,
    ) -> Result<T> {
        self.pages.begin_op();
        let mut tree = BTree::new(self.root, self.order, &mut self.pages);
        let result = op(&mut tree);
        let (root, splits, merges) = (tree.root_page(), tree.split_count(), tree.merge_count());

        match result {
            Ok(value) => {
                self.pages.end_op();
                self.root = root;
                self.db.page_splits.fetch_add(splits, Ordering::Relaxed);
                self.db.page_merges.fetch_add(merges, Ordering::Relaxed);
                Ok(value)
            },
            Err(err) => {
                self.pages.rollback_op();
                tracing::debug!(txn_id = self.pages.txn_id, error = %err, "Operation rolled back");
                Err(err)
            },
        }
    }

    /// Commits the transaction.
    ///
    /// A transaction with no changes commits as a no-op. After a failure
    /// the previous committed state stays current, in memory and on disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if writing pages, the meta slot or a sync fails,
    /// or [`Error::StorageExhausted`] if the free list cannot be stored.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        if !self.pages.has_changes() {
            self.pages.discard();
            tracing::debug!(txn_id = self.pages.txn_id, "Empty commit");
            return Ok(());
        }

        let mut meta_touched = false;
        let result = self.write_commit(&mut meta_touched);
        if let Err(err) = &result {
            if meta_touched {
                tracing::warn!(
                    txn_id = self.pages.txn_id,
                    error = %err,
                    "Commit failed after writing the meta slot; its pages stay reserved"
                );
                self.pages.abandon();
            } else {
                tracing::debug!(txn_id = self.pages.txn_id, error = %err, "Commit failed");
                self.pages.discard();
            }
        }
        result
    }

    fn write_commit(&mut self, meta_touched: &mut bool) -> Result<()> {
        let db = self.db;
        let txn_id = self.pages.txn_id;
        let page_size = db.page_size;

        // The chain written by the previous commit is still referenced by
        // the active meta slot, so it retires like any vacated page.
        let mut vacated = self.pages.vacated.clone();
        vacated.extend_from_slice(&self.writer.free_list_chain);
        let pending = db.pending_frees.lock().entries();

        let mut chain = Vec::new();
        loop {
            let listed = db.allocator.free_page_count() + pending.len() + vacated.len();
            if chain.len() >= freelist::pages_needed(listed, page_size) {
                break;
            }
            chain.push(self.pages.allocate_id()?);
        }

        let entries: Vec<FreeEntry> = db
            .allocator
            .get_free_list()
            .into_iter()
            .map(|page_id| FreeEntry { page_id, freed_by: 0 })
            .chain(pending.iter().map(|&(freed_by, page_id)| FreeEntry { page_id, freed_by }))
            .chain(vacated.iter().map(|&page_id| FreeEntry { page_id, freed_by: txn_id }))
            .collect();
        let list_pages = freelist::build_chain(&chain, &entries, page_size, txn_id)?;

        let meta = MetaSlot {
            page_size: page_size as u32,
            order: self.order,
            txn_id,
            root: self.root,
            free_list_head: chain.first().copied().unwrap_or(0),
            total_pages: db.allocator.next_page_id(),
            entries: self.entries,
            timestamp: SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs()),
        };

        {
            let backend = db.backend.read();
            for page in self.pages.overlay.values().chain(&list_pages) {
                backend.write_page(page.id, &page.data)?;
            }
            if db.syncs_on_commit() {
                backend.sync()?;
            }

            *meta_touched = true;
            backend.write_meta(meta.slot_index(), &meta.to_bytes())?;
            if db.syncs_on_commit() {
                backend.sync()?;
            }
        }

        let pages_written = self.pages.overlay.len();
        for (_, page) in self.pages.overlay.drain() {
            db.cache.insert(page);
        }
        self.pages.allocated.clear();
        self.pages.vacated.clear();

        db.committed.store(Arc::new(CommittedState {
            txn_id,
            root: self.root,
            order: self.order,
            entries: self.entries,
        }));
        let vacated_count = vacated.len();
        db.pending_frees.lock().record(txn_id, vacated);
        self.writer.free_list_chain = chain;

        tracing::debug!(
            txn_id,
            root = self.root,
            entries = self.entries,
            pages_written,
            vacated = vacated_count,
            free_list_pages = self.writer.free_list_chain.len(),
            "Committed"
        );
        Ok(())
    }

    /// Discards all changes and releases the writer lock.
    pub fn abort(mut self) {
        self.finished = true;
        self.pages.discard();
        tracing::debug!(txn_id = self.pages.txn_id, "Write transaction aborted");
    }
}

impl<B: StorageBackend> Drop for WriteTransaction<'_, B> {
    fn drop(&mut self) {
        if !self.finished {
            self.pages.discard();
            tracing::debug!(txn_id = self.pages.txn_id, "Write transaction dropped without commit");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read as _, Seek as _, SeekFrom, Write as _};

    use super::*;
    use crate::backend::META_SLOT_SIZE;

    fn memory_db() -> Database<InMemoryBackend> {
        Database::open_in_memory().unwrap()
    }

    fn keys(db: &Database<impl StorageBackend>) -> Vec<Vec<u8>> {
        db.read().unwrap().iter().map(|entry| entry.unwrap().0).collect()
    }

    #[test]
    fn test_database_config_builder() {
        let config = DatabaseConfig::builder()
            .page_size(8192)
            .cache_size(512)
            .flags(OpenFlags::NO_SYNC)
            .writer_wait(WriterWait::FailFast)
            .max_pages(100)
            .build();

        assert_eq!(config.page_size, 8192);
        assert_eq!(config.cache_size, 512);
        assert!(config.flags.contains(OpenFlags::NO_SYNC));
        assert_eq!(config.writer_wait, WriterWait::FailFast);
        assert_eq!(config.max_pages, Some(100));
        assert_eq!(config.file_mode, DEFAULT_FILE_MODE);
    }

    #[test]
    fn test_database_config_builder_defaults() {
        let from_builder = DatabaseConfig::builder().build();
        let from_default = DatabaseConfig::default();

        assert_eq!(from_builder.page_size, from_default.page_size);
        assert_eq!(from_builder.cache_size, from_default.cache_size);
        assert_eq!(from_builder.flags, from_default.flags);
        assert_eq!(from_builder.writer_wait, from_default.writer_wait);
        assert_eq!(from_builder.max_pages, from_default.max_pages);
    }

    #[test]
    fn test_config_validation() {
        assert!(DatabaseConfig::default().validate().is_ok());
        for config in [
            DatabaseConfig::builder().page_size(1000).build(),
            DatabaseConfig::builder().cache_size(0).build(),
            DatabaseConfig::builder().max_pages(1).build(),
        ] {
            assert!(matches!(config.validate(), Err(Error::InvalidConfig { .. })));
        }
    }

    #[test]
    fn test_put_get_delete() {
        let db = memory_db();
        db.put(b"alpha", b"1").unwrap();
        db.put(b"beta", b"2").unwrap();

        assert_eq!(db.get(b"alpha").unwrap(), b"1");
        assert_eq!(db.get(b"beta").unwrap(), b"2");

        db.delete(b"alpha").unwrap();
        assert!(matches!(db.get(b"alpha"), Err(Error::NotFound)));
        assert!(matches!(db.delete(b"alpha"), Err(Error::NotFound)));
        assert_eq!(db.stats().unwrap().entries, 1);
    }

    #[test]
    fn test_key_errors() {
        let db = memory_db();
        assert!(matches!(db.put(b"", b"v"), Err(Error::EmptyKey)));
        assert!(matches!(db.delete(b""), Err(Error::EmptyKey)));
        assert!(matches!(db.put(&[7u8; 5000], b"v"), Err(Error::KeyTooLarge { .. })));

        db.put(b"k", b"v1").unwrap();
        assert!(matches!(db.put_with(b"k", b"v2", PutFlags::NO_OVERWRITE), Err(Error::KeyExists)));
        assert_eq!(db.get(b"k").unwrap(), b"v1");
    }

    #[test]
    fn test_key_errors_do_not_wait_for_writer() {
        let db = memory_db();
        let _held = db.write().unwrap();

        // Blocking writer policy: these would hang if they took the lock first.
        assert!(matches!(db.put(b"", b"v"), Err(Error::EmptyKey)));
        assert!(matches!(db.put(&[7u8; 5000], b"v"), Err(Error::KeyTooLarge { .. })));
        assert!(matches!(db.delete(b""), Err(Error::EmptyKey)));

        let config = DatabaseConfig::builder().writer_wait(WriterWait::FailFast).build();
        let db = Database::open_in_memory_with_config(config).unwrap();
        let _held = db.write().unwrap();
        assert!(matches!(db.put_with(b"", b"v", PutFlags::NO_OVERWRITE), Err(Error::EmptyKey)));
        assert!(matches!(db.delete(b""), Err(Error::EmptyKey)));
        assert!(matches!(db.put(b"k", b"v"), Err(Error::WriterBusy)));
    }

    #[test]
    fn test_many_keys_in_one_transaction() {
        let db = memory_db();
        let mut txn = db.write().unwrap();
        for i in 0..3000u32 {
            txn.put(format!("key-{i:06}").as_bytes(), format!("value-{i}").as_bytes()).unwrap();
        }
        assert_eq!(txn.len(), 3000);
        txn.commit().unwrap();

        let read = db.read().unwrap();
        assert_eq!(read.len(), 3000);
        assert!(read.depth().unwrap() >= 2);
        for i in (0..3000u32).step_by(97) {
            assert_eq!(
                read.get(format!("key-{i:06}").as_bytes()).unwrap(),
                Some(format!("value-{i}").into_bytes())
            );
        }
        assert!(db.stats().unwrap().page_splits > 0);
    }

    #[test]
    fn test_snapshot_isolation() {
        let db = memory_db();
        db.put(b"k", b"old").unwrap();

        let snapshot = db.read().unwrap();
        db.put(b"k", b"new").unwrap();
        db.put(b"other", b"x").unwrap();

        assert_eq!(snapshot.get(b"k").unwrap(), Some(b"old".to_vec()));
        assert_eq!(snapshot.get(b"other").unwrap(), None);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(db.get(b"k").unwrap(), b"new");
    }

    #[test]
    fn test_write_transaction_sees_own_changes() {
        let db = memory_db();
        let mut txn = db.write().unwrap();
        txn.put(b"b", b"2").unwrap();
        txn.put(b"a", b"1").unwrap();
        assert_eq!(txn.get(b"a").unwrap(), Some(b"1".to_vec()));

        let seen: Vec<_> = txn.iter().map(|entry| entry.unwrap().0).collect();
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);

        // Not visible outside until commit.
        assert!(db.read().unwrap().is_empty());
        txn.commit().unwrap();
        assert_eq!(keys(&db), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_abort_and_drop_discard_changes() {
        let db = memory_db();
        db.put(b"keep", b"1").unwrap();

        let mut txn = db.write().unwrap();
        txn.put(b"gone", b"2").unwrap();
        txn.delete(b"keep").unwrap();
        txn.abort();

        {
            let mut txn = db.write().unwrap();
            txn.put(b"also-gone", b"3").unwrap();
        }

        assert_eq!(keys(&db), vec![b"keep".to_vec()]);
        assert_eq!(db.stats().unwrap().txn_id, 1);
    }

    #[test]
    fn test_empty_commit_is_noop() {
        let db = memory_db();
        db.put(b"k", b"v").unwrap();
        let before = db.stats().unwrap();

        db.write().unwrap().commit().unwrap();

        let after = db.stats().unwrap();
        assert_eq!(after.txn_id, before.txn_id);
        assert_eq!(after.total_pages, before.total_pages);
    }

    #[test]
    fn test_writer_busy() {
        let db = memory_db();
        let txn = db.write().unwrap();

        assert!(matches!(db.try_write(), Err(Error::WriterBusy)));
        drop(txn);
        assert!(db.try_write().is_ok());
    }

    #[test]
    fn test_writer_wait_policies() {
        let config = DatabaseConfig::builder()
            .writer_wait(WriterWait::Timeout(Duration::from_millis(20)))
            .build();
        let db = Database::open_in_memory_with_config(config).unwrap();
        let txn = db.write().unwrap();
        assert!(matches!(db.write(), Err(Error::WriterBusy)));
        drop(txn);

        let config = DatabaseConfig::builder().writer_wait(WriterWait::FailFast).build();
        let db = Database::open_in_memory_with_config(config).unwrap();
        let _txn = db.write().unwrap();
        assert!(matches!(db.write(), Err(Error::WriterBusy)));
    }

    #[test]
    fn test_failed_operation_keeps_transaction_state() {
        let config = DatabaseConfig::builder().max_pages(8).build();
        let db = Database::open_in_memory_with_config(config).unwrap();

        let mut txn = db.write().unwrap();
        txn.put(b"small", b"value").unwrap();
        let big = vec![0xABu8; 10 * 4096];
        assert!(matches!(txn.put(b"big", &big), Err(Error::StorageExhausted { limit: 8 })));

        assert_eq!(txn.get(b"small").unwrap(), Some(b"value".to_vec()));
        assert_eq!(txn.get(b"big").unwrap(), None);
        assert_eq!(txn.len(), 1);
        txn.commit().unwrap();

        assert_eq!(db.get(b"small").unwrap(), b"value");
        assert!(matches!(db.get(b"big"), Err(Error::NotFound)));
        assert!(db.verify().unwrap().errors.is_empty());
    }

    #[test]
    fn test_vacated_pages_wait_for_readers() {
        let db = memory_db();
        db.put(b"k", b"v0").unwrap();

        let reader = db.read().unwrap();
        for i in 1..5 {
            db.put(b"k", format!("v{i}").as_bytes()).unwrap();
        }
        let during = db.stats().unwrap();
        assert!(during.pending_free_pages > 0);
        assert_eq!(reader.get(b"k").unwrap(), Some(b"v0".to_vec()));
        drop(reader);

        // With the reader gone, the next writer reuses instead of growing.
        let before = db.stats().unwrap().total_pages;
        for i in 5..10 {
            db.put(b"k", format!("v{i}").as_bytes()).unwrap();
        }
        assert_eq!(db.stats().unwrap().total_pages, before);
        assert_eq!(db.get(b"k").unwrap(), b"v9");
    }

    #[test]
    fn test_read_only_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.burrow");
        {
            let db = Database::open(&path).unwrap();
            db.put(b"k", b"v").unwrap();
            db.close().unwrap();
        }

        let config = DatabaseConfig::builder().flags(OpenFlags::READ_ONLY).build();
        let db = Database::open_with_config(&path, config).unwrap();
        assert_eq!(db.get(b"k").unwrap(), b"v");
        assert!(matches!(db.write(), Err(Error::ReadOnly)));
        assert!(matches!(db.put(b"x", b"y"), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_read_only_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig::builder().flags(OpenFlags::READ_ONLY).build();
        let result = Database::open_with_config(dir.path().join("missing.burrow"), config);
        assert!(matches!(result, Err(Error::Io { .. })));
    }

    #[test]
    fn test_file_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.burrow");

        {
            let db = Database::open(&path).unwrap();
            for i in 0..200u32 {
                db.put(format!("key-{i}").as_bytes(), format!("value-{i}").as_bytes()).unwrap();
            }
            db.delete(b"key-7").unwrap();
        }

        let db = Database::open(&path).unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.entries, 199);
        assert_eq!(stats.txn_id, 201);
        assert!(matches!(db.get(b"key-7"), Err(Error::NotFound)));
        for i in (0..200u32).filter(|&i| i != 7) {
            assert_eq!(db.get(format!("key-{i}").as_bytes()).unwrap(), format!("value-{i}").into_bytes());
        }
    }

    #[test]
    fn test_free_list_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("freelist.burrow");

        let (free_before, total_before) = {
            let db = Database::open(&path).unwrap();
            let mut txn = db.write().unwrap();
            for i in 0..500u32 {
                txn.put(format!("{i:05}").as_bytes(), &[1u8; 100]).unwrap();
            }
            txn.commit().unwrap();
            let mut txn = db.write().unwrap();
            for i in 0..400u32 {
                txn.delete(format!("{i:05}").as_bytes()).unwrap();
            }
            txn.commit().unwrap();

            let stats = db.stats().unwrap();
            (stats.free_pages + stats.pending_free_pages, stats.total_pages)
        };

        let db = Database::open(&path).unwrap();
        let stats = db.stats().unwrap();
        assert!(free_before > 0);
        assert_eq!(stats.free_pages, free_before);
        assert_eq!(stats.total_pages, total_before);
        assert!(db.verify().unwrap().errors.is_empty());
    }

    #[test]
    fn test_reverse_order_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reverse.burrow");

        {
            let config = DatabaseConfig::builder().flags(OpenFlags::REVERSE_KEY).build();
            let db = Database::open_with_config(&path, config).unwrap();
            for key in [&b"b"[..], b"c", b"a"] {
                db.put(key, b"").unwrap();
            }
            assert_eq!(keys(&db), vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
        }

        // Reopened without the flag, the stored comparator still applies.
        let db = Database::open(&path).unwrap();
        assert_eq!(db.key_order(), KeyOrder::Reverse);
        assert_eq!(keys(&db), vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_reverse_flag_ignored_for_forward_tree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forward.burrow");
        {
            let db = Database::open(&path).unwrap();
            db.put(b"a", b"").unwrap();
            db.put(b"b", b"").unwrap();
        }

        let config = DatabaseConfig::builder().flags(OpenFlags::REVERSE_KEY).build();
        let db = Database::open_with_config(&path, config).unwrap();
        assert_eq!(db.key_order(), KeyOrder::Forward);
        assert_eq!(keys(&db), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    fn flip_meta_byte(path: &Path, slot: usize) {
        let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path).unwrap();
        let offset = (slot * META_SLOT_SIZE + 20) as u64;
        let mut byte = [0u8; 1];
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.read_exact(&mut byte).unwrap();
        byte[0] ^= 0xFF;
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&byte).unwrap();
        file.sync_all().unwrap();
    }

    #[test]
    fn test_corrupt_newest_meta_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.burrow");
        {
            let db = Database::open(&path).unwrap();
            db.put(b"first", b"1").unwrap();
            db.put(b"second", b"2").unwrap();
        }

        // Transaction 2 lives in slot 0.
        flip_meta_byte(&path, 0);

        let db = Database::open(&path).unwrap();
        assert_eq!(db.stats().unwrap().txn_id, 1);
        assert_eq!(db.get(b"first").unwrap(), b"1");
        assert!(matches!(db.get(b"second"), Err(Error::NotFound)));

        // The next commit rewrites the damaged slot.
        db.put(b"third", b"3").unwrap();
        drop(db);
        let db = Database::open(&path).unwrap();
        assert_eq!(db.stats().unwrap().txn_id, 2);
        assert_eq!(db.get(b"third").unwrap(), b"3");
    }

    #[test]
    fn test_both_meta_slots_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.burrow");
        {
            let db = Database::open(&path).unwrap();
            db.put(b"k", b"v").unwrap();
        }
        flip_meta_byte(&path, 0);
        flip_meta_byte(&path, 1);

        assert!(matches!(Database::open(&path), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_short_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.burrow");
        std::fs::write(&path, b"BURROWDB").unwrap();
        assert!(matches!(Database::open(&path), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_unreadable_free_list_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rebuild.burrow");
        {
            let db = Database::open(&path).unwrap();
            for i in 0..300u32 {
                db.put(format!("{i:04}").as_bytes(), &[9u8; 64]).unwrap();
            }
            for i in 0..300u32 {
                if i % 3 == 0 {
                    db.delete(format!("{i:04}").as_bytes()).unwrap();
                }
            }
        }

        let mut head_bytes = vec![0u8; 2 * META_SLOT_SIZE];
        std::fs::File::open(&path).unwrap().read_exact(&mut head_bytes).unwrap();
        let (meta, _) =
            MetaSlot::select(&head_bytes[..META_SLOT_SIZE], &head_bytes[META_SLOT_SIZE..]).unwrap();
        assert_ne!(meta.free_list_head, 0);
        {
            let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            let offset = meta.free_list_head * meta.page_size as u64 + 100;
            file.seek(SeekFrom::Start(offset)).unwrap();
            file.write_all(&[0xEE; 8]).unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert!(db.stats().unwrap().free_pages > 0);
        assert_eq!(db.stats().unwrap().entries, 200);
        assert!(db.verify().unwrap().errors.is_empty());
        db.put(b"after", b"rebuild").unwrap();
        assert_eq!(db.get(b"after").unwrap(), b"rebuild");
    }

    #[test]
    fn test_second_writable_handle_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.burrow");
        let _db = Database::open(&path).unwrap();
        assert!(matches!(Database::open(&path), Err(Error::Locked { .. })));
    }

    #[test]
    fn test_concurrent_writers_from_threads() {
        use std::thread;

        let db = Arc::new(memory_db());
        let mut handles = Vec::new();
        for thread_id in 0..4 {
            let db = Arc::clone(&db);
            handles.push(thread::spawn(move || {
                for i in 0..50 {
                    let key = format!("key-{thread_id}-{i}");
                    db.put(key.as_bytes(), key.as_bytes()).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().expect("writer thread panicked");
        }

        assert_eq!(db.stats().unwrap().entries, 200);
        assert_eq!(db.stats().unwrap().txn_id, 200);
    }
}
