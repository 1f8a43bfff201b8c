//! Shared test utilities for burrow crates.
//!
//! This crate provides common test helpers to reduce boilerplate across test modules:
//!
//! - [`TestDir`] - Managed temporary directory with path helpers
//! - [`CrashInjector`] - Decides which storage operation a faulty backend fails
//! - [`HarnessRng`] - Reproducible key sequences for scenario tests
//! - [`strategies`] - Proptest generators for key/value workloads

#![deny(unsafe_code)]

mod test_dir;
pub use test_dir::TestDir;

mod crash_injector;
pub use crash_injector::{CrashInjector, CrashPoint};

mod harness;
pub use harness::{HarnessRng, MAX_KEY_LEN, harness_keys, harness_value, prefix_pairs};

pub mod strategies;
