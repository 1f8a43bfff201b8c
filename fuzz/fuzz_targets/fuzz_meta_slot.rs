//! Fuzz target for meta slot and page header parsing.
//!
//! Arbitrary bytes must never panic the parsers, and any slot that parses
//! must serialize back to a slot that parses to the same value. Pages are
//! only built from buffers that hold at least a header, as storage reads
//! always return whole pages.

#![no_main]

use burrow_store::{MetaSlot, PAGE_HEADER_SIZE, Page, backend::META_SLOT_SIZE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(meta) = MetaSlot::from_bytes(data) {
        let bytes = meta.to_bytes();
        assert_eq!(MetaSlot::from_bytes(&bytes).ok(), Some(meta));
    }

    if data.len() >= 2 * META_SLOT_SIZE {
        let (slot0, rest) = data.split_at(META_SLOT_SIZE);
        let _ = MetaSlot::select(slot0, &rest[..META_SLOT_SIZE]);
    }

    if data.len() >= PAGE_HEADER_SIZE {
        let page = Page::from_bytes(1, data.to_vec());
        let _ = page.header();
        let _ = page.verify();
    }
});
