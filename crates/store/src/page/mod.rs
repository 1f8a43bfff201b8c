//! Page management for the store engine.
//!
//! This module handles:
//! - Page layout and structure
//! - Page allocation (free pool and file growth)
//! - Page caching (clock eviction)
//! - Checksum computation and verification

mod allocator;
mod cache;

pub use allocator::PageAllocator;
pub use cache::{CacheStats, PageCache};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, PageId, PageType, Result};

/// Page header size in bytes.
pub const PAGE_HEADER_SIZE: usize = 24;

/// First byte covered by the page checksum.
const CHECKSUM_START: usize = 8;

/// Page header structure (24 bytes).
///
/// ```text
/// Offset  Size   Field
/// ------  ----   -----
/// 0       1      Page type (PageType enum)
/// 1       1      Flags (reserved)
/// 2       2      Item count (for B-tree pages)
/// 4       4      Checksum (XXH3-64 truncated, over bytes 8..page_size)
/// 8       8      Transaction ID that wrote this page
/// 16      8      Page number the page was written to
/// ```
///
/// The page number is covered by the checksum, so a page written to the
/// wrong offset is detected on read.
#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    /// Page type.
    pub page_type: PageType,
    /// Flags (reserved for future use).
    pub flags: u8,
    /// Number of items in this page (for B-tree pages).
    pub item_count: u16,
    /// XXH3-64 checksum truncated to 32 bits.
    pub checksum: u32,
    /// Transaction ID that wrote this page.
    pub txn_id: u64,
    /// Page number recorded in the page itself.
    pub page_id: PageId,
}

impl PageHeader {
    /// Creates a new page header.
    pub fn new(page_type: PageType, page_id: PageId, txn_id: u64) -> Self {
        Self { page_type, flags: 0, item_count: 0, checksum: 0, txn_id, page_id }
    }

    /// Serializes header to bytes.
    pub fn to_bytes(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        buf[0] = self.page_type as u8;
        buf[1] = self.flags;
        LittleEndian::write_u16(&mut buf[2..4], self.item_count);
        LittleEndian::write_u32(&mut buf[4..8], self.checksum);
        LittleEndian::write_u64(&mut buf[8..16], self.txn_id);
        LittleEndian::write_u64(&mut buf[16..24], self.page_id);
        buf
    }

    /// Deserializes header from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the buffer is shorter than [`PAGE_HEADER_SIZE`]
    /// or the page type byte is invalid.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(Error::Corrupted { reason: "Page header too short".to_string() });
        }

        Ok(Self {
            page_type: PageType::try_from(buf[0])?,
            flags: buf[1],
            item_count: LittleEndian::read_u16(&buf[2..4]),
            checksum: LittleEndian::read_u32(&buf[4..8]),
            txn_id: LittleEndian::read_u64(&buf[8..16]),
            page_id: LittleEndian::read_u64(&buf[16..24]),
        })
    }
}

/// A page of data with header and content.
#[derive(Clone)]
pub struct Page {
    /// Page ID (position in file).
    pub id: PageId,
    /// Raw page data including header.
    pub data: Vec<u8>,
    /// Whether this page has been modified since it was read or written.
    pub dirty: bool,
}

impl Page {
    /// Creates a new empty page.
    pub fn new(id: PageId, page_size: usize, page_type: PageType, txn_id: u64) -> Self {
        let mut data = vec![0u8; page_size];
        let header = PageHeader::new(page_type, id, txn_id);
        data[..PAGE_HEADER_SIZE].copy_from_slice(&header.to_bytes());

        Self { id, data, dirty: true }
    }

    /// Creates a page from raw bytes read from storage.
    pub fn from_bytes(id: PageId, data: Vec<u8>) -> Self {
        Self { id, data, dirty: false }
    }

    /// Returns the page header.
    ///
    /// # Errors
    ///
    /// Returns an error if the header bytes are corrupted or the page type is invalid.
    pub fn header(&self) -> Result<PageHeader> {
        PageHeader::from_bytes(&self.data)
    }

    /// Returns the page type.
    ///
    /// # Errors
    ///
    /// Returns an error if the page type byte is invalid.
    pub fn page_type(&self) -> Result<PageType> {
        PageType::try_from(self.data[0])
    }

    /// Fails unless the page has type `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageTypeMismatch`] on a different type.
    pub fn expect_type(&self, expected: PageType) -> Result<()> {
        let found = self.page_type()?;
        if found != expected {
            return Err(Error::PageTypeMismatch { expected, found });
        }
        Ok(())
    }

    /// Returns the item count.
    pub fn item_count(&self) -> u16 {
        LittleEndian::read_u16(&self.data[2..4])
    }

    /// Sets the item count.
    pub fn set_item_count(&mut self, count: u16) {
        LittleEndian::write_u16(&mut self.data[2..4], count);
        self.dirty = true;
    }

    /// Returns the transaction that last wrote this page.
    pub fn txn_id(&self) -> u64 {
        LittleEndian::read_u64(&self.data[8..16])
    }

    /// Returns the page number stored in the header.
    pub fn stored_id(&self) -> PageId {
        LittleEndian::read_u64(&self.data[16..24])
    }

    /// Moves the page to a new number, updating the header to match.
    pub fn relocate(&mut self, id: PageId) {
        self.id = id;
        LittleEndian::write_u64(&mut self.data[16..24], id);
        self.dirty = true;
    }

    /// Stamps the writing transaction and refreshes the checksum before a write.
    pub fn seal(&mut self, txn_id: u64) {
        LittleEndian::write_u64(&mut self.data[8..16], txn_id);
        LittleEndian::write_u64(&mut self.data[16..24], self.id);
        self.update_checksum();
    }

    /// Returns the content portion of the page (after header).
    pub fn content(&self) -> &[u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }

    /// Returns mutable content portion.
    pub fn content_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.data[PAGE_HEADER_SIZE..]
    }

    /// Computes and stores the checksum using XXH3-64 (truncated to 32 bits).
    pub fn update_checksum(&mut self) {
        let checksum = xxhash_rust::xxh3::xxh3_64(&self.data[CHECKSUM_START..]) as u32;
        LittleEndian::write_u32(&mut self.data[4..8], checksum);
    }

    /// Verifies the page checksum.
    pub fn verify_checksum(&self) -> bool {
        let stored_checksum = LittleEndian::read_u32(&self.data[4..8]);
        let computed_checksum = xxhash_rust::xxh3::xxh3_64(&self.data[CHECKSUM_START..]) as u32;
        stored_checksum == computed_checksum
    }

    /// Verifies a page freshly read from storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PageNotFound`] for an all-zero page,
    /// [`Error::PageChecksumMismatch`] for a bad checksum, and
    /// [`Error::Corrupted`] when the page claims a different page number.
    pub fn verify(&self) -> Result<()> {
        if self.data.iter().all(|&b| b == 0) {
            return Err(Error::PageNotFound { page_id: self.id });
        }
        if !self.verify_checksum() {
            return Err(Error::PageChecksumMismatch { page_id: self.id });
        }
        if self.stored_id() != self.id {
            return Err(Error::Corrupted {
                reason: format!("Page {} found at position {}", self.stored_id(), self.id),
            });
        }
        Ok(())
    }

    /// Returns the page size.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Returns the usable content size (total size minus header).
    pub fn content_size(&self) -> usize {
        self.data.len() - PAGE_HEADER_SIZE
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("size", &self.data.len())
            .field("dirty", &self.dirty)
            .field("header", &self.header())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DEFAULT_PAGE_SIZE;

    #[test]
    fn test_page_header_round_trip() {
        let header = PageHeader {
            page_type: PageType::BTreeLeaf,
            flags: 0,
            item_count: 42,
            checksum: 0xDEADBEEF,
            txn_id: 12345,
            page_id: 77,
        };

        let bytes = header.to_bytes();
        let recovered = PageHeader::from_bytes(&bytes).unwrap();

        assert_eq!(header.page_type, recovered.page_type);
        assert_eq!(header.item_count, recovered.item_count);
        assert_eq!(header.checksum, recovered.checksum);
        assert_eq!(header.txn_id, recovered.txn_id);
        assert_eq!(header.page_id, recovered.page_id);
    }

    #[test]
    fn test_page_checksum() {
        let mut page = Page::new(3, DEFAULT_PAGE_SIZE, PageType::BTreeLeaf, 1);

        page.content_mut()[0] = 0x42;
        page.content_mut()[100] = 0xFF;
        page.seal(9);

        assert!(page.verify_checksum());
        assert!(page.verify().is_ok());
        assert_eq!(page.txn_id(), 9);

        page.data[PAGE_HEADER_SIZE + 50] ^= 0xFF;
        assert!(!page.verify_checksum());
        assert!(matches!(page.verify(), Err(Error::PageChecksumMismatch { page_id: 3 })));
    }

    #[test]
    fn test_checksum_covers_page_number() {
        let mut page = Page::new(3, DEFAULT_PAGE_SIZE, PageType::BTreeLeaf, 1);
        page.seal(1);
        page.data[16] = 4;
        assert!(!page.verify_checksum());
    }

    #[test]
    fn test_misplaced_page_detected() {
        let mut page = Page::new(3, DEFAULT_PAGE_SIZE, PageType::Overflow, 1);
        page.seal(1);
        let moved = Page::from_bytes(8, page.data.clone());
        assert!(matches!(moved.verify(), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn test_zero_page_is_not_found() {
        let page = Page::from_bytes(5, vec![0u8; DEFAULT_PAGE_SIZE]);
        assert!(matches!(page.verify(), Err(Error::PageNotFound { page_id: 5 })));
    }

    #[test]
    fn test_relocate_updates_header() {
        let mut page = Page::new(3, DEFAULT_PAGE_SIZE, PageType::BTreeBranch, 1);
        page.relocate(12);
        assert_eq!(page.id, 12);
        assert_eq!(page.stored_id(), 12);
        assert!(page.expect_type(PageType::BTreeBranch).is_ok());
        assert!(matches!(
            page.expect_type(PageType::BTreeLeaf),
            Err(Error::PageTypeMismatch { .. })
        ));
    }
}
