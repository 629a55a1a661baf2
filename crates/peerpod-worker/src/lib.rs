//! Peerpod worker
//!
//! Durable job queue with per-type dispatchers and bounded concurrency.

pub mod handler;
pub mod queue;

pub use handler::JobHandler;
pub use queue::{JobFinishedSender, JobQueue, JobQueueConfig};
