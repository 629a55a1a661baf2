//! Database repositories for data access layer
//!
//! Repositories are organized into media/ (records, jobs) and federation/ (friend
//! pods, outbound queues). `transaction` holds the retry executor every record
//! mutation goes through.
//
// Record and job repositories
pub mod media;
//
// Pod registry and outbox repositories
pub mod federation;
//
// Transaction executor
pub mod transaction;

pub use federation::{OutboxRepository, PodRepository};
pub use media::JobRepository;
