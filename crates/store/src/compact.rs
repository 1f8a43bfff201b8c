//! Offline compaction.
//!
//! Copies the live tree into a fresh backend with consecutive page numbers,
//! then swaps it in for the original. Free pages and stale free-list chains
//! are left behind, so the result holds exactly the reachable pages.
//!
//! Compaction needs the writer lock and no open readers for its whole
//! duration; it never waits for either.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    backend::{META_SLOTS, MetaSlot, StorageBackend},
    btree::{
        MAX_DEPTH,
        node::{
            BranchNode, BranchNodeRef, LeafNode, LeafNodeRef, LeafValue, set_leaf_cell_overflow,
        },
        overflow::{next_page, pages_for, set_next_page},
    },
    db::Database,
    error::{Error, PageId, PageType, Result},
    page::Page,
    transaction::CommittedState,
};

/// Outcome of a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    /// Page slots before compaction, including page 0.
    pub pages_before: u64,
    /// Page slots after compaction, including page 0.
    pub pages_after: u64,
    /// Storage size before compaction.
    pub bytes_before: u64,
    /// Storage size after compaction.
    pub bytes_after: u64,
}

impl CompactionStats {
    /// Pages given back by the compaction.
    pub fn pages_reclaimed(&self) -> u64 {
        self.pages_before.saturating_sub(self.pages_after)
    }
}

impl<B: StorageBackend> Database<B> {
    /// Rewrites the database into the smallest file holding its live data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] on a read-only handle.
    /// Returns [`Error::WriterBusy`] if a write transaction is open.
    /// Returns [`Error::ReadersActive`] if any read transaction is open.
    /// Returns [`Error::Io`] if the copy or the swap fails; the original
    /// file is left untouched in that case.
    pub fn compact(&self) -> Result<CompactionStats> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        let mut writer = self.writer.try_lock().ok_or(Error::WriterBusy)?;

        self.tracker.exclusive(|| {
            let state = self.committed.load_full();
            let pages_before = self.allocator.next_page_id();
            let bytes_before = self.backend.read().file_size()?;

            let target = self.backend.read().create_compaction_target()?;
            let mut copier = Copier { db: self, target: &target, next: 1, txn_id: state.txn_id };
            let root = if state.root == 0 { 0 } else { copier.copy_node(state.root, 1)? };
            let pages_after = copier.next;

            let meta = MetaSlot {
                page_size: self.page_size as u32,
                order: state.order,
                txn_id: state.txn_id,
                root,
                free_list_head: 0,
                total_pages: pages_after,
                entries: state.entries,
                timestamp: SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs()),
            };
            let bytes = meta.to_bytes();
            for slot in 0..META_SLOTS {
                target.write_meta(slot, &bytes)?;
            }
            target.sync()?;

            let bytes_after = {
                let mut backend = self.backend.write();
                backend.install_compacted(target)?;
                backend.file_size()?
            };

            self.allocator.reset(pages_after, Vec::new());
            self.pending_frees.lock().clear();
            self.cache.clear();
            writer.free_list_chain.clear();
            self.committed.store(Arc::new(CommittedState { root, ..(*state).clone() }));

            let stats = CompactionStats { pages_before, pages_after, bytes_before, bytes_after };
            tracing::info!(
                txn_id = state.txn_id,
                pages_before,
                pages_after,
                bytes_before,
                bytes_after,
                "Compacted database"
            );
            Ok(stats)
        })
    }
}

/// Post-order copy of the tree into a compaction target.
struct Copier<'a, B: StorageBackend> {
    db: &'a Database<B>,
    target: &'a B,
    next: PageId,
    txn_id: u64,
}

impl<B: StorageBackend> Copier<'_, B> {
    fn take_ids(&mut self, count: u64) -> PageId {
        let first = self.next;
        self.next += count;
        first
    }

    fn write(&self, mut page: Page, page_id: PageId) -> Result<()> {
        page.relocate(page_id);
        page.seal(self.txn_id);
        self.target.write_page(page_id, &page.data)
    }

    /// Copies the subtree under `page_id` and returns its new page number.
    fn copy_node(&mut self, page_id: PageId, depth: usize) -> Result<PageId> {
        if depth > MAX_DEPTH {
            return Err(Error::Corrupted {
                reason: format!("Tree deeper than {MAX_DEPTH} levels at page {page_id}"),
            });
        }

        let page = self.db.read_page(page_id)?;
        match page.page_type()? {
            PageType::BTreeLeaf => self.copy_leaf(&page),
            PageType::BTreeBranch => self.copy_branch(&page, depth),
            found => Err(Error::PageTypeMismatch { expected: PageType::BTreeBranch, found }),
        }
    }

    fn copy_leaf(&mut self, page: &Page) -> Result<PageId> {
        let leaf = LeafNodeRef::from_page(page)?;
        let mut cells = leaf.cells();
        for (idx, cell) in cells.iter_mut().enumerate() {
            if let LeafValue::Overflow { head, len } = leaf.value(idx) {
                let new_head = self.copy_overflow(head, len as usize)?;
                set_leaf_cell_overflow(cell, new_head);
            }
        }

        let page_id = self.take_ids(1);
        let mut copy = Page::new(page_id, self.db.page_size, PageType::BTreeLeaf, self.txn_id);
        LeafNode::init(&mut copy);
        {
            let mut node = LeafNode::from_page(&mut copy)?;
            for (idx, cell) in cells.iter().enumerate() {
                node.insert_cell(idx, cell)?;
            }
        }
        self.write(copy, page_id)?;
        Ok(page_id)
    }

    fn copy_branch(&mut self, page: &Page, depth: usize) -> Result<PageId> {
        let branch = BranchNodeRef::from_page(page)?;
        let mut children = Vec::with_capacity(branch.cell_count() + 1);
        for idx in 0..=branch.cell_count() {
            children.push(self.copy_node(branch.child_at(idx), depth + 1)?);
        }

        let page_id = self.take_ids(1);
        let mut copy = Page::new(page_id, self.db.page_size, PageType::BTreeBranch, self.txn_id);
        BranchNode::init(&mut copy, children[branch.cell_count()]);
        {
            let mut node = BranchNode::from_page(&mut copy)?;
            for idx in 0..branch.cell_count() {
                node.insert(idx, branch.key(idx), children[idx])?;
            }
        }
        self.write(copy, page_id)?;
        Ok(page_id)
    }

    fn copy_overflow(&mut self, head: PageId, len: usize) -> Result<PageId> {
        let count = pages_for(len, self.db.page_size) as u64;
        let first = self.take_ids(count);

        let mut current = head;
        for offset in 0..count {
            if current == 0 {
                return Err(Error::Corrupted {
                    reason: format!("Overflow chain at {head} ends before {len} bytes"),
                });
            }
            let mut page = self.db.read_page(current)?;
            page.expect_type(PageType::Overflow)?;
            current = next_page(&page);

            let new_next = if offset + 1 < count { first + offset + 1 } else { 0 };
            set_next_page(&mut page, new_next);
            self.write(page, first + offset)?;
        }
        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::InMemoryBackend,
        db::{DatabaseConfig, ReadTransaction},
        types::OpenFlags,
    };

    fn dump<B: StorageBackend>(txn: &ReadTransaction<'_, B>) -> Vec<(Vec<u8>, Vec<u8>)> {
        txn.iter().map(|entry| entry.unwrap()).collect()
    }

    fn churned_db() -> Database<InMemoryBackend> {
        let db = Database::open_in_memory().unwrap();
        let mut txn = db.write().unwrap();
        for i in 0..1000u32 {
            txn.put(format!("key-{i:05}").as_bytes(), &[b'x'; 80]).unwrap();
        }
        txn.put(b"large", &vec![7u8; 20_000]).unwrap();
        txn.commit().unwrap();

        let mut txn = db.write().unwrap();
        for i in 0..1000u32 {
            if i % 10 != 0 {
                txn.delete(format!("key-{i:05}").as_bytes()).unwrap();
            }
        }
        txn.commit().unwrap();
        db
    }

    #[test]
    fn test_compact_shrinks_and_preserves_data() {
        let db = churned_db();
        let before = dump(&db.read().unwrap());
        let txn_before = db.stats().unwrap().txn_id;

        let stats = db.compact().unwrap();
        assert!(stats.pages_after < stats.pages_before);
        assert!(stats.pages_reclaimed() > 0);

        let after = db.stats().unwrap();
        assert_eq!(after.total_pages, stats.pages_after);
        assert_eq!(after.free_pages, 0);
        assert_eq!(after.pending_free_pages, 0);
        assert_eq!(after.txn_id, txn_before);
        assert_eq!(after.entries, 101);

        assert_eq!(dump(&db.read().unwrap()), before);
        assert_eq!(db.get(b"large").unwrap(), vec![7u8; 20_000]);
        assert!(db.verify().unwrap().errors.is_empty());
    }

    #[test]
    fn test_compact_then_write() {
        let db = churned_db();
        db.compact().unwrap();

        db.put(b"new", b"value").unwrap();
        db.delete(b"key-00010").unwrap();
        assert_eq!(db.get(b"new").unwrap(), b"value");
        assert!(db.verify().unwrap().errors.is_empty());
    }

    #[test]
    fn test_compact_empty_database() {
        let db = Database::open_in_memory().unwrap();
        let stats = db.compact().unwrap();
        assert_eq!(stats.pages_after, 1);
        assert!(db.read().unwrap().is_empty());
    }

    #[test]
    fn test_compact_requires_exclusive_access() {
        let db = churned_db();

        let reader = db.read().unwrap();
        assert!(matches!(db.compact(), Err(Error::ReadersActive { count: 1 })));
        drop(reader);

        let writer = db.write().unwrap();
        assert!(matches!(db.compact(), Err(Error::WriterBusy)));
        drop(writer);

        assert!(db.compact().is_ok());
    }

    #[test]
    fn test_compact_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compact.burrow");

        let (expected, bytes_after) = {
            let db = Database::open(&path).unwrap();
            for i in 0..500u32 {
                db.put(format!("{i:04}").as_bytes(), &[1u8; 200]).unwrap();
            }
            for i in 0..450u32 {
                db.delete(format!("{i:04}").as_bytes()).unwrap();
            }
            let stats = db.compact().unwrap();
            assert!(stats.bytes_after < stats.bytes_before);
            (dump(&db.read().unwrap()), stats.bytes_after)
        };

        let mut compact_path = path.as_os_str().to_os_string();
        compact_path.push(".compact");
        assert!(!std::path::Path::new(&compact_path).exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), bytes_after);

        let db = Database::open(&path).unwrap();
        assert_eq!(dump(&db.read().unwrap()), expected);
        assert!(db.verify().unwrap().errors.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_compact_keeps_file_mode_after_reopen() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private.burrow");
        let mode_of = |path: &std::path::Path| {
            std::fs::metadata(path).unwrap().permissions().mode() & 0o777
        };

        {
            let config = DatabaseConfig::builder().file_mode(0o600).build();
            let db = Database::open_with_config(&path, config).unwrap();
            let mut txn = db.write().unwrap();
            for i in 0..200u32 {
                txn.put(format!("{i:04}").as_bytes(), &[3u8; 100]).unwrap();
            }
            txn.commit().unwrap();
            let mut txn = db.write().unwrap();
            for i in 0..150u32 {
                txn.delete(format!("{i:04}").as_bytes()).unwrap();
            }
            txn.commit().unwrap();
        }
        assert_eq!(mode_of(&path), 0o600);

        // Reopened with the default config, which would create files as 0o644.
        let db = Database::open(&path).unwrap();
        db.compact().unwrap();
        assert_eq!(mode_of(&path), 0o600);
        assert_eq!(db.stats().unwrap().entries, 50);
    }

    #[test]
    fn test_compact_read_only_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.burrow");
        Database::open(&path).unwrap().close().unwrap();

        let config = DatabaseConfig::builder().flags(OpenFlags::READ_ONLY).build();
        let db = Database::open_with_config(&path, config).unwrap();
        assert!(matches!(db.compact(), Err(Error::ReadOnly)));
    }
}
