//! Overflow chains for values too large to sit inline in a leaf.
//!
//! ```text
//! Offset  Size   Field
//! 0       24     Page header (type Overflow)
//! 24      8      Next page in the chain (0 = last)
//! 32      4      Bytes of value data in this page
//! 36      ..     Value data
//! ```

use byteorder::{ByteOrder, LittleEndian};

use super::{PageProvider, PageSource, node::LeafValue};
use crate::{
    error::{Error, PageId, PageType, Result},
    page::{PAGE_HEADER_SIZE, Page},
};

const NEXT_OFFSET: usize = PAGE_HEADER_SIZE;
const LEN_OFFSET: usize = PAGE_HEADER_SIZE + 8;

/// Offset of value data within an overflow page.
pub const OVERFLOW_DATA_START: usize = PAGE_HEADER_SIZE + 12;

/// Value bytes carried by one overflow page.
pub fn chunk_capacity(page_size: usize) -> usize {
    page_size - OVERFLOW_DATA_START
}

/// Number of pages a value of `len` bytes occupies.
pub fn pages_for(len: usize, page_size: usize) -> usize {
    len.div_ceil(chunk_capacity(page_size))
}

/// Next pointer of an overflow page.
pub fn next_page(page: &Page) -> PageId {
    LittleEndian::read_u64(&page.data[NEXT_OFFSET..NEXT_OFFSET + 8])
}

/// Rewrites the next pointer of an overflow page.
pub fn set_next_page(page: &mut Page, next: PageId) {
    LittleEndian::write_u64(&mut page.data[NEXT_OFFSET..NEXT_OFFSET + 8], next);
    page.dirty = true;
}

fn chunk(page: &Page) -> Result<&[u8]> {
    let len = LittleEndian::read_u32(&page.data[LEN_OFFSET..LEN_OFFSET + 4]) as usize;
    if OVERFLOW_DATA_START + len > page.size() {
        return Err(Error::Corrupted {
            reason: format!("Overflow page {} claims {len} bytes", page.id),
        });
    }
    Ok(&page.data[OVERFLOW_DATA_START..OVERFLOW_DATA_START + len])
}

/// Writes `value` into a new overflow chain and returns its head.
///
/// Every page is allocated before any is written so each page can name its
/// successor. If an allocation fails, the pages taken so far are freed.
///
/// # Errors
///
/// Returns [`Error::ValueTooLarge`] for values over `u32::MAX` bytes, or
/// any allocation or write error from the provider.
pub fn write_overflow<P: PageProvider + ?Sized>(provider: &mut P, value: &[u8]) -> Result<PageId> {
    if u32::try_from(value.len()).is_err() {
        return Err(Error::ValueTooLarge { size: value.len(), max: u32::MAX as usize });
    }
    let capacity = chunk_capacity(provider.page_size());
    let chunks: Vec<&[u8]> = value.chunks(capacity).collect();

    let mut pages = Vec::with_capacity(chunks.len());
    for _ in &chunks {
        match provider.allocate_page(PageType::Overflow) {
            Ok(page) => pages.push(page),
            Err(e) => {
                for page in &pages {
                    provider.free_page(page.id);
                }
                return Err(e);
            },
        }
    }

    let ids: Vec<PageId> = pages.iter().map(|p| p.id).collect();
    let head = ids.first().copied().ok_or_else(|| Error::Corrupted {
        reason: "Overflow chain for an empty value".to_string(),
    })?;

    for (i, (mut page, data)) in pages.into_iter().zip(chunks).enumerate() {
        set_next_page(&mut page, ids.get(i + 1).copied().unwrap_or(0));
        LittleEndian::write_u32(&mut page.data[LEN_OFFSET..LEN_OFFSET + 4], data.len() as u32);
        page.data[OVERFLOW_DATA_START..OVERFLOW_DATA_START + data.len()].copy_from_slice(data);
        provider.write_page(page)?;
    }
    Ok(head)
}

/// Walks a chain of `len` bytes starting at `head`, calling `visit` on each
/// page. Fails on a wrong page type, a chain longer than `len` requires,
/// or a byte count that does not add up to `len`.
fn walk<S, F>(source: &S, head: PageId, len: usize, mut visit: F) -> Result<()>
where
    S: PageSource + ?Sized,
    F: FnMut(&Page, &[u8]),
{
    let limit = pages_for(len, source.page_size());
    let mut next = head;
    let mut visited = 0;
    let mut total = 0;
    while next != 0 {
        visited += 1;
        if visited > limit {
            return Err(Error::Corrupted {
                reason: format!("Overflow chain at page {head} is longer than {limit} pages"),
            });
        }
        let page = source.read_page(next)?;
        page.expect_type(PageType::Overflow)?;
        let data = chunk(&page)?;
        total += data.len();
        visit(&page, data);
        next = next_page(&page);
    }
    if total != len {
        return Err(Error::Corrupted {
            reason: format!("Overflow chain at page {head} holds {total} bytes, expected {len}"),
        });
    }
    Ok(())
}

/// Reads a whole overflow value.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if the chain is malformed, or any read error.
pub fn read_overflow<S: PageSource + ?Sized>(source: &S, head: PageId, len: usize) -> Result<Vec<u8>> {
    let mut value = Vec::with_capacity(len);
    walk(source, head, len, |_, data| value.extend_from_slice(data))?;
    Ok(value)
}

/// Lists the pages of an overflow chain in order.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if the chain is malformed, or any read error.
pub fn overflow_pages<S: PageSource + ?Sized>(
    source: &S,
    head: PageId,
    len: usize,
) -> Result<Vec<PageId>> {
    let mut ids = Vec::with_capacity(pages_for(len, source.page_size()));
    walk(source, head, len, |page, _| ids.push(page.id))?;
    Ok(ids)
}

/// Frees every page of an overflow chain.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if the chain is malformed, or any read error.
pub fn free_overflow<P: PageProvider + ?Sized>(provider: &mut P, head: PageId, len: usize) -> Result<()> {
    for page_id in overflow_pages(&*provider, head, len)? {
        provider.free_page(page_id);
    }
    Ok(())
}

/// Materializes a leaf value, following its overflow chain if needed.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if the chain is malformed, or any read error.
pub fn load_value<S: PageSource + ?Sized>(source: &S, value: LeafValue<'_>) -> Result<Vec<u8>> {
    match value {
        LeafValue::Inline(bytes) => Ok(bytes.to_vec()),
        LeafValue::Overflow { head, len } => read_overflow(source, head, len as usize),
    }
}
