//! Storage backend abstraction for the store engine.
//!
//! The backend trait abstracts the underlying storage mechanism,
//! allowing both file-based (production) and in-memory (testing) implementations.
//!
//! # File Layout
//!
//! ```text
//! offset 0            512           page_size      2 * page_size
//! ┌───────────────────┬─────────────┬──────────────┬──────────────┬──
//! │ meta slot 0       │ meta slot 1 │ (rest of     │ page 1       │ page 2 ...
//! │                   │             │  page 0)     │              │
//! └───────────────────┴─────────────┴──────────────┴──────────────┴──
//! ```
//!
//! Page 0 is reserved for the two meta slots, so page number 0 doubles as the
//! "no page" marker everywhere else. Data pages are addressed by number only;
//! byte offsets never leave this module.
//!
//! # Crash Safety: Alternating Meta Slots
//!
//! Transaction `t` commits by writing slot `t % 2`, leaving the slot that
//! describes transaction `t - 1` untouched. On open both slots are validated
//! and the one with the highest valid transaction id wins:
//!
//! 1. **Write data pages.** Only pages unreachable from either slot are written.
//! 2. **Sync** (skipped under `NO_SYNC`). The new tree is durable.
//! 3. **Write the inactive slot.** A torn write fails the slot checksum.
//! 4. **Sync** (skipped under `NO_SYNC`).
//!
//! A crash anywhere before step 4 completes leaves the previous slot valid and
//! pointing at a fully written tree.

mod file;
mod memory;

pub use file::{DEFAULT_FILE_MODE, FileBackend};
pub use memory::InMemoryBackend;

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    error::{Error, PageId, Result},
    types::KeyOrder,
};

/// Default page size: 4KB (4096 bytes).
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest supported page size. Page 0 must fit both meta slots.
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest supported page size. Slot offsets inside a page are `u16`.
pub const MAX_PAGE_SIZE: usize = 32768;

/// Size of one meta slot on disk.
pub const META_SLOT_SIZE: usize = 512;

/// Number of meta slots.
pub const META_SLOTS: usize = 2;

/// First page number available for data.
pub const FIRST_DATA_PAGE: PageId = 1;

/// Magic number for burrow database files.
pub const MAGIC: &[u8; 8] = b"BURROWDB";

/// Current format version.
pub const FORMAT_VERSION: u16 = 1;

/// Storage backend trait for abstracting file I/O.
pub trait StorageBackend: Send + Sync {
    /// Reads meta slot `slot` (0 or 1), returning [`META_SLOT_SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the read fails.
    fn read_meta(&self, slot: usize) -> Result<Vec<u8>>;

    /// Overwrites meta slot `slot` (0 or 1).
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write fails.
    /// Returns `Error::Corrupted` if the slot index or buffer size is wrong.
    fn write_meta(&self, slot: usize, data: &[u8]) -> Result<()>;

    /// Reads a page by its ID. Pages past the end of storage read as zeros.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the read fails.
    fn read_page(&self, page_id: PageId) -> Result<Vec<u8>>;

    /// Writes a page at the given ID, growing storage as needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write fails.
    /// Returns `Error::Corrupted` if the data size does not match the page size.
    fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()>;

    /// Flushes all writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the sync fails.
    fn sync(&self) -> Result<()>;

    /// Returns the current storage size in bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the metadata query fails.
    fn file_size(&self) -> Result<u64>;

    /// Returns the page size for this backend.
    fn page_size(&self) -> usize;

    /// Calculates the byte offset for a page ID.
    fn page_offset(&self, page_id: PageId) -> u64 {
        page_id * self.page_size() as u64
    }

    /// Creates an empty backend of the same kind to receive a compacted copy.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the target cannot be created.
    fn create_compaction_target(&self) -> Result<Self>
    where
        Self: Sized;

    /// Replaces this backend with a fully written compaction target.
    ///
    /// The target's contents must be durable before it becomes visible under
    /// this backend's name.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the swap fails. This backend stays usable.
    fn install_compacted(&mut self, target: Self) -> Result<()>
    where
        Self: Sized;
}

/// Checks that a page size is a power of two within the supported range.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] if the page size is unsupported.
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(Error::InvalidConfig {
            reason: format!(
                "page size {page_size} must be a power of two in {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}"
            ),
        });
    }
    Ok(())
}

/// One meta slot: the committed database state at a point in time.
///
/// # Layout (512 bytes, first 72 used)
///
/// ```text
/// Offset  Size   Field
/// ------  ----   -----
/// 0       8      Magic "BURROWDB"
/// 8       2      Format version
/// 10      2      Flags (bit 0: reverse key order)
/// 12      4      Page size
/// 16      8      Transaction ID
/// 24      8      Root page (0 = empty tree)
/// 32      8      Free list head (0 = none)
/// 40      8      Total pages (next unallocated page number)
/// 48      8      Live entry count
/// 56      8      Timestamp of the commit (Unix epoch seconds)
/// 64      8      XXH3-64 of bytes 0..64
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaSlot {
    /// Page size in bytes.
    pub page_size: u32,
    /// Key order of the tree.
    pub order: KeyOrder,
    /// Transaction that wrote this slot.
    pub txn_id: u64,
    /// Root page of the tree, 0 when empty.
    pub root: PageId,
    /// First free-list page, 0 when the free list is empty.
    pub free_list_head: PageId,
    /// Number of page slots in use, including page 0.
    pub total_pages: u64,
    /// Number of live key/value pairs.
    pub entries: u64,
    /// Commit time (Unix epoch seconds).
    pub timestamp: u64,
}

impl MetaSlot {
    const CHECKSUMMED_SIZE: usize = 64;

    /// Creates the meta slot of a freshly initialized file.
    pub fn new(page_size: usize, order: KeyOrder) -> Self {
        Self {
            page_size: page_size as u32,
            order,
            txn_id: 0,
            root: 0,
            free_list_head: 0,
            total_pages: FIRST_DATA_PAGE,
            entries: 0,
            timestamp: 0,
        }
    }

    /// Index of the slot this meta is written to.
    pub fn slot_index(&self) -> usize {
        (self.txn_id % META_SLOTS as u64) as usize
    }

    /// Serializes the slot to bytes.
    pub fn to_bytes(&self) -> [u8; META_SLOT_SIZE] {
        let mut buf = [0u8; META_SLOT_SIZE];
        buf[0..8].copy_from_slice(MAGIC);
        LittleEndian::write_u16(&mut buf[8..10], FORMAT_VERSION);
        LittleEndian::write_u16(&mut buf[10..12], self.order.to_flags());
        LittleEndian::write_u32(&mut buf[12..16], self.page_size);
        LittleEndian::write_u64(&mut buf[16..24], self.txn_id);
        LittleEndian::write_u64(&mut buf[24..32], self.root);
        LittleEndian::write_u64(&mut buf[32..40], self.free_list_head);
        LittleEndian::write_u64(&mut buf[40..48], self.total_pages);
        LittleEndian::write_u64(&mut buf[48..56], self.entries);
        LittleEndian::write_u64(&mut buf[56..64], self.timestamp);
        let checksum = xxhash_rust::xxh3::xxh3_64(&buf[..Self::CHECKSUMMED_SIZE]);
        LittleEndian::write_u64(&mut buf[64..72], checksum);
        buf
    }

    /// Parses and validates a slot.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidMagic` if the magic number does not match.
    /// Returns `Error::UnsupportedVersion` for a newer format version.
    /// Returns `Error::Corrupted` for a short buffer, a checksum mismatch, or an
    /// impossible field value.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_SLOT_SIZE {
            return Err(Error::Corrupted { reason: "Meta slot too short".to_string() });
        }
        if &buf[0..8] != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = LittleEndian::read_u16(&buf[8..10]);
        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion { version });
        }
        let stored = LittleEndian::read_u64(&buf[64..72]);
        if xxhash_rust::xxh3::xxh3_64(&buf[..Self::CHECKSUMMED_SIZE]) != stored {
            return Err(Error::Corrupted { reason: "Meta slot checksum mismatch".to_string() });
        }

        let meta = Self {
            order: KeyOrder::from_flags(LittleEndian::read_u16(&buf[10..12])),
            page_size: LittleEndian::read_u32(&buf[12..16]),
            txn_id: LittleEndian::read_u64(&buf[16..24]),
            root: LittleEndian::read_u64(&buf[24..32]),
            free_list_head: LittleEndian::read_u64(&buf[32..40]),
            total_pages: LittleEndian::read_u64(&buf[40..48]),
            entries: LittleEndian::read_u64(&buf[48..56]),
            timestamp: LittleEndian::read_u64(&buf[56..64]),
        };

        validate_page_size(meta.page_size as usize).map_err(|_| Error::Corrupted {
            reason: format!("Meta slot has invalid page size {}", meta.page_size),
        })?;
        if meta.total_pages < FIRST_DATA_PAGE
            || meta.root >= meta.total_pages
            || meta.free_list_head >= meta.total_pages
        {
            return Err(Error::Corrupted {
                reason: format!(
                    "Meta slot references pages beyond total {} (root {}, free list {})",
                    meta.total_pages, meta.root, meta.free_list_head
                ),
            });
        }
        Ok(meta)
    }

    /// Picks the active slot: the valid one with the highest transaction id.
    ///
    /// Returns the chosen meta and the index of the slot it was read from.
    ///
    /// # Errors
    ///
    /// Returns `Error::Corrupted` if neither slot is valid or the two valid
    /// slots disagree on the page size.
    pub fn select(slot0: &[u8], slot1: &[u8]) -> Result<(MetaSlot, usize)> {
        match (Self::from_bytes(slot0), Self::from_bytes(slot1)) {
            (Ok(a), Ok(b)) => {
                if a.page_size != b.page_size {
                    return Err(Error::Corrupted {
                        reason: format!(
                            "Meta slots disagree on page size ({} vs {})",
                            a.page_size, b.page_size
                        ),
                    });
                }
                if b.txn_id > a.txn_id { Ok((b, 1)) } else { Ok((a, 0)) }
            },
            (Ok(a), Err(err)) => {
                tracing::warn!(slot = 1, error = %err, txn_id = a.txn_id, "Meta slot invalid, using slot 0");
                Ok((a, 0))
            },
            (Err(err), Ok(b)) => {
                tracing::warn!(slot = 0, error = %err, txn_id = b.txn_id, "Meta slot invalid, using slot 1");
                Ok((b, 1))
            },
            (Err(e0), Err(e1)) => Err(Error::Corrupted {
                reason: format!("Both meta slots invalid (slot 0: {e0}; slot 1: {e1})"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(txn_id: u64) -> MetaSlot {
        MetaSlot {
            txn_id,
            root: 7,
            free_list_head: 3,
            total_pages: 10,
            entries: 42,
            timestamp: 1_700_000_000,
            ..MetaSlot::new(DEFAULT_PAGE_SIZE, KeyOrder::Reverse)
        }
    }

    #[test]
    fn test_meta_round_trip() {
        let slot = meta(5);
        let recovered = MetaSlot::from_bytes(&slot.to_bytes()).unwrap();
        assert_eq!(slot, recovered);
        assert_eq!(recovered.order, KeyOrder::Reverse);
    }

    #[test]
    fn test_meta_checksum_detects_corruption() {
        let mut bytes = meta(5).to_bytes();
        bytes[30] ^= 0xFF;
        assert!(matches!(MetaSlot::from_bytes(&bytes), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_meta_rejects_bad_magic_and_version() {
        let mut bytes = meta(1).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(MetaSlot::from_bytes(&bytes), Err(Error::InvalidMagic)));

        let mut bytes = meta(1).to_bytes();
        LittleEndian::write_u16(&mut bytes[8..10], 9);
        assert!(matches!(
            MetaSlot::from_bytes(&bytes),
            Err(Error::UnsupportedVersion { version: 9 })
        ));
    }

    #[test]
    fn test_meta_rejects_root_past_total_pages() {
        let slot = MetaSlot { root: 99, ..meta(1) };
        assert!(matches!(MetaSlot::from_bytes(&slot.to_bytes()), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_select_highest_txn() {
        let (chosen, index) = MetaSlot::select(&meta(4).to_bytes(), &meta(5).to_bytes()).unwrap();
        assert_eq!(chosen.txn_id, 5);
        assert_eq!(index, 1);

        let (chosen, index) = MetaSlot::select(&meta(6).to_bytes(), &meta(5).to_bytes()).unwrap();
        assert_eq!(chosen.txn_id, 6);
        assert_eq!(index, 0);
    }

    #[test]
    fn test_select_falls_back_to_valid_slot() {
        let mut newer = meta(9).to_bytes();
        newer[20] ^= 0x01;
        let (chosen, index) = MetaSlot::select(&meta(8).to_bytes(), &newer).unwrap();
        assert_eq!(chosen.txn_id, 8);
        assert_eq!(index, 0);
    }

    #[test]
    fn test_select_both_invalid() {
        let zeros = [0u8; META_SLOT_SIZE];
        assert!(matches!(MetaSlot::select(&zeros, &zeros), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_slot_index_alternates() {
        assert_eq!(meta(0).slot_index(), 0);
        assert_eq!(meta(1).slot_index(), 1);
        assert_eq!(meta(2).slot_index(), 0);
    }

    #[test]
    fn test_validate_page_size() {
        assert!(validate_page_size(4096).is_ok());
        assert!(validate_page_size(MIN_PAGE_SIZE).is_ok());
        assert!(validate_page_size(MAX_PAGE_SIZE).is_ok());
        assert!(validate_page_size(512).is_err());
        assert!(validate_page_size(65536).is_err());
        assert!(validate_page_size(3000).is_err());
    }
}
