//! Page cache for committed pages.
//!
//! Only pages that are already on disk enter the cache: a write
//! transaction keeps its own pages in its overlay until commit. Committed
//! pages never change in place, so a cached copy stays valid until its page
//! number is reused by a later commit, which overwrites the entry.
//!
//! Eviction uses the clock algorithm (approximate LRU) over a fixed ring of
//! slots.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use super::Page;
use crate::error::PageId;

/// Page cache with clock eviction.
///
/// Tracks hit/miss counters for observability.
pub struct PageCache {
    inner: Mutex<ClockRing>,
    /// Maximum number of pages to cache.
    capacity: usize,
    /// Total cache hits since creation.
    hits: AtomicU64,
    /// Total cache misses since creation.
    misses: AtomicU64,
}

struct ClockRing {
    /// Page number to slot index.
    index: HashMap<PageId, usize>,
    slots: Vec<Slot>,
    hand: usize,
}

struct Slot {
    page: Page,
    /// Second-chance bit, set on every access.
    referenced: bool,
}

impl PageCache {
    /// Creates a new cache with the given capacity (at least one page).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(ClockRing {
                index: HashMap::with_capacity(capacity),
                slots: Vec::with_capacity(capacity),
                hand: 0,
            }),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns a clone of the cached page, or `None` if not present.
    pub fn get(&self, page_id: PageId) -> Option<Page> {
        let mut ring = self.inner.lock();
        match ring.index.get(&page_id).copied() {
            Some(slot) => {
                ring.slots[slot].referenced = true;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(ring.slots[slot].page.clone())
            },
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            },
        }
    }

    /// Inserts or replaces a page, evicting one entry if the cache is full.
    pub fn insert(&self, mut page: Page) {
        page.dirty = false;
        let mut ring = self.inner.lock();

        if let Some(&slot) = ring.index.get(&page.id) {
            ring.slots[slot] = Slot { page, referenced: true };
            return;
        }

        if ring.slots.len() < self.capacity {
            let slot = ring.slots.len();
            ring.index.insert(page.id, slot);
            ring.slots.push(Slot { page, referenced: true });
            return;
        }

        let victim = ring.advance_to_victim();
        let evicted = ring.slots[victim].page.id;
        ring.index.remove(&evicted);
        ring.index.insert(page.id, victim);
        ring.slots[victim] = Slot { page, referenced: true };
    }

    /// Removes a page from the cache.
    pub fn remove(&self, page_id: PageId) -> Option<Page> {
        let mut ring = self.inner.lock();
        let slot = ring.index.remove(&page_id)?;
        let removed = ring.slots.swap_remove(slot);
        if slot < ring.slots.len() {
            let moved = ring.slots[slot].page.id;
            ring.index.insert(moved, slot);
        }
        if ring.hand >= ring.slots.len() {
            ring.hand = 0;
        }
        Some(removed.page)
    }

    /// Clears all cached pages.
    pub fn clear(&self) {
        let mut ring = self.inner.lock();
        ring.index.clear();
        ring.slots.clear();
        ring.hand = 0;
    }

    /// Returns the number of cached pages.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Checks if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks if a page is in the cache.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.inner.lock().index.contains_key(&page_id)
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl ClockRing {
    /// Sweeps the hand until it finds a slot without its second chance.
    ///
    /// Terminates within two sweeps: the first clears every reference bit.
    fn advance_to_victim(&mut self) -> usize {
        loop {
            if self.hand >= self.slots.len() {
                self.hand = 0;
            }
            let slot = self.hand;
            self.hand += 1;
            if self.slots[slot].referenced {
                self.slots[slot].referenced = false;
            } else {
                return slot;
            }
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Current number of cached pages.
    pub size: usize,
    /// Maximum capacity.
    pub capacity: usize,
    /// Total cache hits since creation.
    pub hits: u64,
    /// Total cache misses since creation.
    pub misses: u64,
}
