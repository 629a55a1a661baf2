//! Peerpod Database Layer
//!
//! Postgres repositories behind the store traits, the transaction retry executor,
//! and an in-memory store for tests.

pub mod db;
pub mod store_traits;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

// Re-exports: Repositories
pub use db::{JobRepository, OutboxRepository, PodRepository};

// Re-exports: Transaction executor
pub use db::transaction::{
    execute, AttemptSnapshot, Committed, PgMediaTx, PgTransactionalStore, RetryOptions,
    TransactionalStore, UnitOfWork,
};

// Re-exports: Store traits
pub use store_traits::{JobStore, MediaTransaction, OutboxStore, PodStore};
