//! Fuzz target for transactional key/value operations.
//!
//! Decodes the input into puts, deletes, commits and aborts against an
//! in-memory database and mirrors them in a `BTreeMap`. After every commit
//! or abort the committed contents must equal the model, and the tree must
//! pass an integrity scrub at the end.

#![no_main]

use std::collections::BTreeMap;

use burrow_store::{Database, Error};
use libfuzzer_sys::fuzz_target;

type Model = BTreeMap<Vec<u8>, Vec<u8>>;

/// Splits a length-prefixed chunk off the front of `data`.
fn take<'a>(data: &mut &'a [u8], max: usize) -> Option<&'a [u8]> {
    let (&len, rest) = data.split_first()?;
    let len = (len as usize % (max + 1)).min(rest.len());
    let (chunk, rest) = rest.split_at(len);
    *data = rest;
    Some(chunk)
}

fn committed(db: &Database<burrow_store::InMemoryBackend>) -> Model {
    db.read().unwrap().iter().map(|entry| entry.unwrap()).collect()
}

fuzz_target!(|data: &[u8]| {
    let db = Database::open_in_memory().unwrap();
    let mut model = Model::new();
    let mut pending = model.clone();
    let mut txn = db.write().unwrap();
    let mut input = data;

    while let Some((&op, rest)) = input.split_first() {
        input = rest;
        match op % 8 {
            0..=3 => {
                let Some(key) = take(&mut input, 32) else { break };
                // Repeat the value bytes so some entries spill into overflow pages.
                let Some(seed) = take(&mut input, 16) else { break };
                let value = seed.repeat(usize::from(op >> 3) * 64 + 1);
                match txn.put(key, &value) {
                    Ok(()) => {
                        pending.insert(key.to_vec(), value);
                    },
                    Err(Error::EmptyKey) => assert!(key.is_empty()),
                    Err(err) => panic!("put failed: {err}"),
                }
            },
            4 | 5 => {
                let Some(key) = take(&mut input, 32) else { break };
                match txn.delete(key) {
                    Ok(()) => assert!(pending.remove(key).is_some()),
                    Err(Error::NotFound) => assert!(!pending.contains_key(key)),
                    Err(Error::EmptyKey) => assert!(key.is_empty()),
                    Err(err) => panic!("delete failed: {err}"),
                }
            },
            6 => {
                txn.commit().unwrap();
                model = pending.clone();
                assert_eq!(committed(&db), model);
                txn = db.write().unwrap();
            },
            _ => {
                txn.abort();
                pending = model.clone();
                assert_eq!(committed(&db), model);
                txn = db.write().unwrap();
            },
        }
    }

    txn.commit().unwrap();
    assert_eq!(committed(&db), pending);
    assert!(db.verify().unwrap().is_clean());
});
