pub mod orchestrator;
pub mod transcoder;

pub use orchestrator::{MutationOrchestrator, OrchestratorConfig};
pub use transcoder::{FfmpegTranscoder, Transcoder};
