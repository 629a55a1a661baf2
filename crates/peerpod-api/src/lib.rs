//! Peerpod API Library
//!
//! The mutation orchestrator, the transcode job handler, the federation inbox
//! endpoint and application setup.

pub mod error;
pub mod handlers;
pub mod services;
pub mod setup;
pub mod state;
pub mod task_handlers;

// Re-exports
pub use error::{ErrorResponse, HttpAppError};
pub use services::{FfmpegTranscoder, MutationOrchestrator, OrchestratorConfig, Transcoder};
pub use setup::routes::setup_routes;
pub use state::AppState;
pub use task_handlers::TranscodeHandler;
