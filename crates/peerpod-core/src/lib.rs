//! Peerpod Core Library
//!
//! Domain models, error types and configuration shared by every peerpod crate.

pub mod config;
pub mod constants;
pub mod error;
pub mod job_error;
pub mod models;

// Re-export commonly used types
pub use config::{BaseConfig, Config, PodConfig};
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use job_error::{JobError, JobResultExt};
