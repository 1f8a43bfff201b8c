//! Property tests comparing the store against a `BTreeMap` model.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;

use burrow_store::{
    Database, DatabaseConfig, Error, FileBackend, KeyOrder, OpenFlags, StorageBackend,
};
use burrow_test_utils::{
    TestDir,
    strategies::{KvOperation, arb_binary_key, arb_operation_sequence, arb_value},
};
use proptest::prelude::*;

type Model = BTreeMap<Vec<u8>, Vec<u8>>;

/// Applies `ops` through write transactions, committing on every
/// [`KvOperation::Commit`] and once more at the end.
fn apply<B: StorageBackend>(db: &Database<B>, model: &mut Model, ops: &[KvOperation]) {
    let mut txn = db.write().unwrap();
    for op in ops {
        match op {
            KvOperation::Put { key, value } => {
                txn.put(key, value).unwrap();
                model.insert(key.clone(), value.clone());
            },
            KvOperation::Delete { key } => {
                let result = txn.delete(key);
                if model.remove(key).is_some() {
                    result.unwrap();
                } else {
                    assert!(matches!(result, Err(Error::NotFound)), "{result:?}");
                }
            },
            KvOperation::Commit => {
                txn.commit().unwrap();
                txn = db.write().unwrap();
            },
        }
        assert_eq!(txn.len(), model.len() as u64);
    }
    txn.commit().unwrap();
}

fn assert_matches<B: StorageBackend>(db: &Database<B>, model: &Model) {
    let txn = db.read().unwrap();
    let stored: Vec<(Vec<u8>, Vec<u8>)> = txn.iter().map(|entry| entry.unwrap()).collect();
    let mut expected: Vec<(Vec<u8>, Vec<u8>)> =
        model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    if txn.order() == KeyOrder::Reverse {
        expected.reverse();
    }
    assert_eq!(stored, expected);
    assert_eq!(txn.len(), model.len() as u64);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_operations_match_model(ops in arb_operation_sequence()) {
        let db = Database::open_in_memory().unwrap();
        let mut model = Model::new();
        apply(&db, &mut model, &ops);

        assert_matches(&db, &model);
        let scrub = db.verify().unwrap();
        prop_assert!(scrub.is_clean(), "{:?}", scrub.errors);
    }

    #[test]
    fn prop_reverse_order_matches_model(ops in arb_operation_sequence()) {
        let config = DatabaseConfig::builder().flags(OpenFlags::REVERSE_KEY).build();
        let db = Database::open_in_memory_with_config(config).unwrap();
        let mut model = Model::new();
        apply(&db, &mut model, &ops);

        assert_matches(&db, &model);
        prop_assert!(db.verify().unwrap().is_clean());
    }

    #[test]
    fn prop_state_survives_reopen(
        first in arb_operation_sequence(),
        second in arb_operation_sequence(),
    ) {
        let dir = TestDir::new();
        let mut model = Model::new();
        {
            let db = Database::<FileBackend>::open(dir.db_path()).unwrap();
            apply(&db, &mut model, &first);
            db.close().unwrap();
        }
        let db = Database::<FileBackend>::open(dir.db_path()).unwrap();
        assert_matches(&db, &model);

        apply(&db, &mut model, &second);
        assert_matches(&db, &model);
        prop_assert!(db.verify().unwrap().is_clean());
    }

    #[test]
    fn prop_compaction_preserves_contents(ops in arb_operation_sequence()) {
        let db = Database::open_in_memory().unwrap();
        let mut model = Model::new();
        apply(&db, &mut model, &ops);

        let stats = db.compact().unwrap();
        prop_assert!(stats.pages_after <= stats.pages_before);
        assert_matches(&db, &model);
        prop_assert!(db.verify().unwrap().is_clean());
    }

    #[test]
    fn prop_range_matches_model(
        entries in proptest::collection::btree_map(arb_binary_key(), arb_value(), 0..300),
        start in arb_binary_key(),
        end in arb_binary_key(),
    ) {
        let db = Database::open_in_memory().unwrap();
        {
            let mut txn = db.write().unwrap();
            for (key, value) in &entries {
                txn.put(key, value).unwrap();
            }
            txn.commit().unwrap();
        }

        let txn = db.read().unwrap();
        let stored: Vec<Vec<u8>> = txn
            .range(Some(&start), Some(&end))
            .map(|entry| entry.unwrap().0)
            .collect();
        let expected: Vec<Vec<u8>> = if start < end {
            entries.range(start.clone()..end.clone()).map(|(k, _)| k.clone()).collect()
        } else {
            Vec::new()
        };
        prop_assert_eq!(stored, expected);
    }
}
