//! Test helpers
//!
//! An in-memory implementation of every store trait, so services can be tested
//! without a database. Enabled for this crate's tests and, for other crates, through
//! the `test-helpers` feature.

pub mod memory;

pub use memory::{MemoryStore, MemoryTx};
