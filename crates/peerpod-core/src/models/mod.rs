//! Data models for the pod
//!
//! Records and their authors/tags, background jobs, friend pods with their
//! outbound queues, and the federation wire types.

mod federation;
mod job;
mod media;
mod pod;

pub use federation::*;
pub use job::*;
pub use media::*;
pub use pod::*;
