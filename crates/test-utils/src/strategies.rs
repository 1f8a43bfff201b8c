//! Proptest strategies for key/value workloads.
//!
//! Reusable generators for property-based testing across crates. Keys are
//! drawn from a small alphabet so that generated operations collide often
//! enough to exercise overwrites and deletes of existing keys.
//!
//! # Usage
//!
//! ```no_run
//! use burrow_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(ops in strategies::arb_operation_sequence()) {
//!         // apply ops to the store and to a BTreeMap, then compare
//!     }
//! }
//! ```

use proptest::prelude::*;

/// A single mutation of a key/value store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOperation {
    /// Store `value` under `key`.
    Put {
        /// Non-empty key.
        key: Vec<u8>,
        /// Value, possibly empty.
        value: Vec<u8>,
    },
    /// Remove `key` if present.
    Delete {
        /// Non-empty key.
        key: Vec<u8>,
    },
    /// Commit the current transaction and begin a new one.
    Commit,
}

/// Generates a key of 1-8 bytes over `a..=h`, so collisions are frequent.
pub fn arb_key() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(b'a'..=b'h', 1..=8)
}

/// Generates a key of 1-64 arbitrary bytes.
pub fn arb_binary_key() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 1..=64)
}

/// Generates a value of 0-255 random bytes.
pub fn arb_value() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..256)
}

/// Generates a value that is usually small and sometimes spans several pages.
pub fn arb_mixed_value() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        8 => arb_value(),
        1 => (4_000usize..20_000).prop_map(|len| vec![0x5A; len]),
    ]
}

/// Generates an arbitrary [`KvOperation`], weighted towards puts.
pub fn arb_operation() -> impl Strategy<Value = KvOperation> {
    prop_oneof![
        6 => (arb_key(), arb_mixed_value()).prop_map(|(key, value)| KvOperation::Put { key, value }),
        3 => arb_key().prop_map(|key| KvOperation::Delete { key }),
        1 => Just(KvOperation::Commit),
    ]
}

/// Generates a vector of 1-200 arbitrary operations.
pub fn arb_operation_sequence() -> impl Strategy<Value = Vec<KvOperation>> {
    proptest::collection::vec(arb_operation(), 1..200)
}
