use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use peerpod_core::models::{Job, JobId, JobState, JobType};
use peerpod_core::AppError;

use crate::store_traits::JobStore;

const JOB_COLUMNS: &str = r#"
    id,
    job_type,
    state,
    payload,
    result,
    error,
    attempts,
    created_at,
    started_at,
    completed_at
"#;

#[derive(Clone)]
pub struct JobRepository {
    pool: PgPool,
}

impl JobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for JobRepository {
    #[tracing::instrument(skip(self, payload))]
    async fn create_job(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<Job, AppError> {
        let query = format!(
            r#"
            INSERT INTO jobs (id, job_type, state, payload)
            VALUES ($1, $2, 'pending', $3)
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let job = sqlx::query_as::<Postgres, Job>(&query)
            .bind(Uuid::new_v4())
            .bind(job_type.to_string())
            .bind(payload)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, job_type = %job_type, "Failed to insert job");
                AppError::Database(e)
            })?;

        tracing::debug!(job.id = %job.id, job_type = %job_type, "Job persisted");
        Ok(job)
    }

    /// Claims with `FOR UPDATE SKIP LOCKED` so several pod processes can share one table.
    #[tracing::instrument(skip(self))]
    async fn claim_next(&self, job_type: JobType) -> Result<Option<Job>, AppError> {
        let query = format!(
            r#"
            UPDATE jobs
            SET state = 'active',
                attempts = attempts + 1,
                started_at = NOW()
            WHERE id = (
                SELECT id
                FROM jobs
                WHERE job_type = $1 AND state = 'pending'
                ORDER BY created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let job = sqlx::query_as::<Postgres, Job>(&query)
            .bind(job_type.to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    #[tracing::instrument(skip(self, result))]
    async fn mark_completed(&self, id: JobId, result: serde_json::Value) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed', result = $2, completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(result)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self, error))]
    async fn mark_failed(&self, id: JobId, error: serde_json::Value) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'failed', error = $2, completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn recover_interrupted(&self, job_types: &[JobType]) -> Result<u64, AppError> {
        let types: Vec<String> = job_types.iter().map(|t| t.to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', started_at = NULL
            WHERE state = 'active' AND job_type = ANY($1)
            "#,
        )
        .bind(&types)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, AppError> {
        let query = format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS);
        let job = sqlx::query_as::<Postgres, Job>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>, AppError> {
        let limit = limit.clamp(1, 1000);
        let jobs = match state {
            Some(state) => {
                let query = format!(
                    "SELECT {} FROM jobs WHERE state = $1 ORDER BY created_at DESC LIMIT $2",
                    JOB_COLUMNS
                );
                sqlx::query_as::<Postgres, Job>(&query)
                    .bind(state.to_string())
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {} FROM jobs ORDER BY created_at DESC LIMIT $1",
                    JOB_COLUMNS
                );
                sqlx::query_as::<Postgres, Job>(&query)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(jobs)
    }

    #[tracing::instrument(skip(self))]
    async fn retry_failed(&self, id: JobId) -> Result<Option<Job>, AppError> {
        let query = format!(
            r#"
            UPDATE jobs
            SET state = 'pending',
                error = NULL,
                result = NULL,
                started_at = NULL,
                completed_at = NULL,
                created_at = NOW()
            WHERE id = $1 AND state = 'failed'
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let job = sqlx::query_as::<Postgres, Job>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    #[tracing::instrument(skip(self))]
    async fn delete_finished_before(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE state IN ('completed', 'failed') AND completed_at < $1
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
