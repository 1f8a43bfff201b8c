//! Error types for the burrow storage engine.

use std::io;

use snafu::Snafu;

/// Page identifier type.
///
/// Page 0 holds the two meta slots and is never handed out for data, so a
/// stored page number of 0 means "no page".
pub type PageId = u64;

/// Result type alias for burrow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during burrow operations.
#[derive(Debug, Snafu)]
pub enum Error {
    /// I/O error from the underlying storage backend.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Database file is corrupted or has invalid format.
    #[snafu(display("Corrupted database: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// Page checksum verification failed.
    #[snafu(display("Page {page_id} checksum mismatch"))]
    PageChecksumMismatch {
        /// The page whose checksum failed.
        page_id: PageId,
    },

    /// Invalid magic number in a meta slot.
    #[snafu(display("Invalid database magic number"))]
    InvalidMagic,

    /// Unsupported database format version.
    #[snafu(display("Unsupported format version: {version}"))]
    UnsupportedVersion {
        /// The unsupported version number.
        version: u16,
    },

    /// Page type mismatch (expected different type).
    #[snafu(display("Page type mismatch: expected {expected:?}, found {found:?}"))]
    PageTypeMismatch {
        /// The expected page type.
        expected: PageType,
        /// The actual page type found.
        found: PageType,
    },

    /// Zero-length key supplied to a mutation.
    #[snafu(display("Key must not be empty"))]
    EmptyKey,

    /// Key not present in the tree.
    #[snafu(display("Key not found"))]
    NotFound,

    /// Key already present and the put asked not to overwrite it.
    #[snafu(display("Key already exists"))]
    KeyExists,

    /// Cursor moved past either end of the tree.
    #[snafu(display("No such cursor position"))]
    NoSuchPosition,

    /// Another write transaction is active.
    #[snafu(display("Write transaction already in progress"))]
    WriterBusy,

    /// Read transactions are still open and the operation needs exclusive access.
    #[snafu(display("{count} read transactions still active"))]
    ReadersActive {
        /// Number of live read transactions.
        count: usize,
    },

    /// Page not found.
    #[snafu(display("Page {page_id} not found"))]
    PageNotFound {
        /// The missing page ID.
        page_id: PageId,
    },

    /// Page allocation failed because the configured page limit was reached.
    #[snafu(display("Storage exhausted: page limit {limit} reached"))]
    StorageExhausted {
        /// Maximum number of pages the file may hold.
        limit: u64,
    },

    /// Key too large for inline storage.
    #[snafu(display("Key too large: {size} bytes (max {max})"))]
    KeyTooLarge {
        /// Actual size of the key in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// Value longer than an overflow chain can describe.
    #[snafu(display("Value too large: {size} bytes (max {max})"))]
    ValueTooLarge {
        /// Actual size of the value in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// Database is read-only.
    #[snafu(display("Database is read-only"))]
    ReadOnly,

    /// The database file is locked by another handle.
    #[snafu(display("Database file is locked: {path}"))]
    Locked {
        /// Path of the locked file.
        path: String,
    },

    /// Configuration rejected by validation.
    #[snafu(display("Invalid configuration: {reason}"))]
    InvalidConfig {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// Page is full and cannot accept more data even after splitting.
    #[snafu(display("Page is full"))]
    PageFull,
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

/// Page types in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Free/unused page.
    Free = 0,
    /// B-tree branch (internal) node.
    BTreeBranch = 1,
    /// B-tree leaf node.
    BTreeLeaf = 2,
    /// Overflow page for large values.
    Overflow = 3,
    /// Free list page.
    FreeList = 4,
}

impl TryFrom<u8> for PageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Free),
            1 => Ok(Self::BTreeBranch),
            2 => Ok(Self::BTreeLeaf),
            3 => Ok(Self::Overflow),
            4 => Ok(Self::FreeList),
            _ => Err(Error::Corrupted { reason: format!("Invalid page type: {value}") }),
        }
    }
}
