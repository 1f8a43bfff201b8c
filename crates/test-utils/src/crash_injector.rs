//! Crash injection utilities for testing crash recovery.
//!
//! Provides a [`CrashInjector`] that counts storage operations and tells a
//! wrapping backend when to fail one, simulating a crash at a chosen point
//! of the commit sequence:
//!
//! ```text
//! write pages → sync → write meta slot → sync
//!      ↑          ↑           ↑            ↑
//! DuringPageWrite │     DuringMetaWrite    │
//!           BeforeDataSync           BeforeMetaSync
//! ```
//!
//! Each crash point leaves a different partial state on disk; recovery must
//! open either the previous or the new committed state.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

/// Points in the commit sequence where a crash can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    /// A page write fails once the threshold of page writes is reached.
    ///
    /// On disk: some new pages written, meta slots untouched.
    DuringPageWrite,

    /// The sync after the page writes fails.
    ///
    /// On disk: all new pages written but not durable, meta slots untouched.
    BeforeDataSync,

    /// The meta slot write is torn: only its first half reaches the disk.
    ///
    /// On disk: the inactive slot fails its checksum, the active one is intact.
    DuringMetaWrite,

    /// The sync after the meta slot write fails.
    ///
    /// On disk: the new slot is written but its durability is unknown.
    BeforeMetaSync,
}

impl CrashPoint {
    /// Every crash point, for exhaustive tests.
    pub const ALL: [CrashPoint; 4] = [
        CrashPoint::DuringPageWrite,
        CrashPoint::BeforeDataSync,
        CrashPoint::DuringMetaWrite,
        CrashPoint::BeforeMetaSync,
    ];
}

/// Tracks crash injection state for deterministic crash simulation.
///
/// Starts disarmed so setup writes pass through. After the crash fires,
/// every later call returns `false` until the injector is re-armed.
///
/// # Thread Safety
///
/// All state is atomic, making `CrashInjector` safe to share across threads.
#[derive(Debug)]
pub struct CrashInjector {
    crash_point: CrashPoint,
    /// Page writes allowed before [`CrashPoint::DuringPageWrite`] fires.
    page_threshold: AtomicU32,
    sync_count: AtomicU32,
    meta_write_count: AtomicU32,
    page_write_count: AtomicU32,
    crashed: AtomicBool,
    armed: AtomicBool,
}

impl CrashInjector {
    /// Creates a new crash injector targeting the specified crash point.
    pub fn new(crash_point: CrashPoint) -> Arc<Self> {
        Arc::new(Self {
            crash_point,
            page_threshold: AtomicU32::new(0),
            sync_count: AtomicU32::new(0),
            meta_write_count: AtomicU32::new(0),
            page_write_count: AtomicU32::new(0),
            crashed: AtomicBool::new(false),
            armed: AtomicBool::new(false),
        })
    }

    /// Sets how many page writes succeed before a `DuringPageWrite` crash.
    pub fn set_page_threshold(&self, threshold: u32) {
        self.page_threshold.store(threshold, Ordering::SeqCst);
    }

    /// Arms the injector, resetting all counters.
    pub fn arm(&self) {
        self.sync_count.store(0, Ordering::SeqCst);
        self.meta_write_count.store(0, Ordering::SeqCst);
        self.page_write_count.store(0, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Disarms the injector.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Checks if the crash has been triggered.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    fn active(&self) -> bool {
        self.armed.load(Ordering::SeqCst) && !self.crashed.load(Ordering::SeqCst)
    }

    fn trigger(&self, should_crash: bool) -> bool {
        if should_crash {
            self.crashed.store(true, Ordering::SeqCst);
        }
        should_crash
    }

    /// Records a sync. Returns `true` if it should fail.
    pub fn on_sync(&self) -> bool {
        if !self.active() {
            return false;
        }
        let count = self.sync_count.fetch_add(1, Ordering::SeqCst);
        let should_crash = match self.crash_point {
            CrashPoint::BeforeDataSync => count == 0,
            CrashPoint::BeforeMetaSync => count == 1,
            CrashPoint::DuringPageWrite | CrashPoint::DuringMetaWrite => false,
        };
        self.trigger(should_crash)
    }

    /// Records a meta slot write. Returns `true` if it should be torn.
    pub fn on_meta_write(&self) -> bool {
        if !self.active() {
            return false;
        }
        self.meta_write_count.fetch_add(1, Ordering::SeqCst);
        self.trigger(self.crash_point == CrashPoint::DuringMetaWrite)
    }

    /// Records a page write. Returns `true` if it should fail.
    pub fn on_page_write(&self) -> bool {
        if !self.active() {
            return false;
        }
        let count = self.page_write_count.fetch_add(1, Ordering::SeqCst);
        let threshold = self.page_threshold.load(Ordering::SeqCst);
        self.trigger(self.crash_point == CrashPoint::DuringPageWrite && count >= threshold)
    }

    /// Returns the configured crash point.
    pub fn crash_point(&self) -> CrashPoint {
        self.crash_point
    }

    /// Returns the number of syncs observed since arming.
    pub fn sync_count(&self) -> u32 {
        self.sync_count.load(Ordering::SeqCst)
    }

    /// Returns the number of page writes observed since arming.
    pub fn page_write_count(&self) -> u32 {
        self.page_write_count.load(Ordering::SeqCst)
    }
}
