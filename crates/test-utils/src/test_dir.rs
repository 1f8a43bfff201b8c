//! Temporary directory management for tests.
//!
//! [`TestDir`] wraps [`tempfile::TempDir`] with a cleaner API for common test patterns.

// Test utilities are expected to panic on failure - that's their purpose
#![allow(clippy::expect_used)]

use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A managed temporary directory for tests.
///
/// The directory is automatically cleaned up when this struct is dropped.
///
/// # Example
///
/// ```
/// use burrow_test_utils::TestDir;
///
/// let dir = TestDir::new();
/// let db_path = dir.db_path();
/// assert!(db_path.starts_with(dir.path()));
/// // Directory cleaned up when `dir` goes out of scope
/// ```
pub struct TestDir {
    inner: TempDir,
}

impl TestDir {
    /// Create a new temporary directory.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        let inner = TempDir::new().expect("failed to create temp directory");
        Self { inner }
    }

    /// Returns the path to the temporary directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Join a relative path to the temporary directory.
    ///
    /// This is a convenience method equivalent to `dir.path().join(path)`.
    #[must_use]
    pub fn join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.inner.path().join(path)
    }

    /// Path for a database file inside the directory. The file is not created.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.join("test.burrow")
    }

    /// Size of the file at `path` relative to the directory, or 0 if absent.
    #[must_use]
    pub fn file_len<P: AsRef<Path>>(&self, path: P) -> u64 {
        std::fs::metadata(self.join(path)).map_or(0, |meta| meta.len())
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}
