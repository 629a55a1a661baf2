use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use peerpod_core::constants::TRANSCODED_EXTNAME;
use peerpod_core::models::{Job, JobId, TranscodePayload};
use peerpod_core::{AppError, JobError};
use peerpod_db::{MediaTransaction, TransactionalStore};
use peerpod_worker::JobHandler;

use crate::services::{MutationOrchestrator, Transcoder};

/// Transcodes an owned record's upload to mp4, then propagates the record.
///
/// Safe to run twice for the same record: once the record carries the transcoded
/// extension the job only reports success.
pub struct TranscodeHandler<S> {
    orchestrator: Arc<MutationOrchestrator<S>>,
    transcoder: Arc<dyn Transcoder>,
    videos_dir: PathBuf,
}

impl<S> TranscodeHandler<S> {
    pub fn new(
        orchestrator: Arc<MutationOrchestrator<S>>,
        transcoder: Arc<dyn Transcoder>,
        videos_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            orchestrator,
            transcoder,
            videos_dir: videos_dir.into(),
        }
    }

    fn file_path(&self, uuid: Uuid, extname: &str) -> PathBuf {
        self.videos_dir.join(format!("{}{}", uuid, extname))
    }
}

#[async_trait]
impl<S> JobHandler for TranscodeHandler<S>
where
    S: TransactionalStore + 'static,
    S::Tx: MediaTransaction,
{
    #[tracing::instrument(skip(self, job), fields(job.id = %job.id, record.uuid = tracing::field::Empty))]
    async fn process(&self, job: &Job) -> Result<serde_json::Value, JobError> {
        let payload: TranscodePayload = job
            .try_payload_as::<TranscodePayload>()
            .context("Failed to parse transcode payload")
            .map_err(JobError::permanent)?;
        let uuid = payload.record_uuid;
        tracing::Span::current().record("record.uuid", uuid.to_string());

        let record = self
            .orchestrator
            .get_record(uuid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Record {} not found", uuid)))?;

        if !record.is_owned() {
            return Err(JobError::permanent(anyhow!(
                "Record {} belongs to another pod and is never transcoded",
                uuid
            )));
        }

        if record.extname == TRANSCODED_EXTNAME {
            tracing::info!("Record already transcoded");
            return Ok(json!({
                "recordUuid": uuid,
                "extname": record.extname,
                "sequence": record.sequence,
                "transcoded": false,
            }));
        }

        let input = self.file_path(uuid, &record.extname);
        let output = self.file_path(uuid, TRANSCODED_EXTNAME);
        self.transcoder
            .transcode(&input, &output)
            .await
            .map_err(JobError::transient)?;

        let record = self.orchestrator.mark_transcoded(uuid).await?;

        if let Err(e) = tokio::fs::remove_file(&input).await {
            tracing::warn!(error = %e, path = %input.display(), "Failed to remove original upload");
        }

        tracing::info!(sequence = record.sequence, "Record transcoded");
        Ok(json!({
            "recordUuid": uuid,
            "extname": record.extname,
            "sequence": record.sequence,
            "transcoded": true,
        }))
    }

    async fn on_success(&self, job_id: JobId, result: &serde_json::Value) -> anyhow::Result<()> {
        let uuid: Uuid = result
            .get("recordUuid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Transcode result of job {} has no recordUuid", job_id))?
            .parse()
            .context("Invalid recordUuid in transcode result")?;

        self.orchestrator
            .propagate_record(uuid)
            .await
            .map_err(|e| anyhow!("Failed to propagate record {}: {}", uuid, e))
    }

    async fn on_error(&self, error: &JobError, job_id: JobId) {
        tracing::error!(
            job.id = %job_id,
            error = %error,
            retryable = error.is_retryable(),
            "Transcoding failed; the record stays local until the job is retried"
        );
    }
}
