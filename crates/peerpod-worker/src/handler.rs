//! Job handler trait
//!
//! A handler owns one job type. The queue calls `process` for each claimed job and
//! then exactly one of `on_success` / `on_error`, after the job's final state has
//! been persisted.

use async_trait::async_trait;

use peerpod_core::models::{Job, JobId};
use peerpod_core::JobError;

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Do the work. Must tolerate being called again for the same payload: a job
    /// interrupted by a crash is dispatched once more on restart.
    async fn process(&self, job: &Job) -> Result<serde_json::Value, JobError>;

    /// Called after the job is stored as Completed. A failure here is logged and
    /// does not change the job's state.
    async fn on_success(&self, job_id: JobId, result: &serde_json::Value) -> anyhow::Result<()>;

    /// Called once after the job is stored as Failed.
    async fn on_error(&self, error: &JobError, job_id: JobId);
}
