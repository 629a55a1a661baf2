use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};

use peerpod_core::models::OutboxEntry;
use peerpod_core::AppError;

use crate::store_traits::OutboxStore;

const OUTBOX_COLUMNS: &str = r#"
    id,
    pod_id,
    record_uuid,
    sequence,
    message,
    attempts,
    next_attempt_at,
    last_error,
    created_at
"#;

#[derive(Clone)]
pub struct OutboxRepository {
    pool: PgPool,
}

impl OutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for OutboxRepository {
    async fn head(&self, pod_id: i64) -> Result<Option<OutboxEntry>, AppError> {
        let query = format!(
            "SELECT {} FROM outbox WHERE pod_id = $1 ORDER BY id ASC LIMIT 1",
            OUTBOX_COLUMNS
        );
        let entry = sqlx::query_as::<Postgres, OutboxEntry>(&query)
            .bind(pod_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    async fn remove(&self, entry_id: i64) -> Result<(), AppError> {
        sqlx::query("DELETE FROM outbox WHERE id = $1")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        entry_id: i64,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE outbox
            SET attempts = $2, next_attempt_at = $3, last_error = $4
            WHERE id = $1
            "#,
        )
        .bind(entry_id)
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn purge_pod(&self, pod_id: i64) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM outbox WHERE pod_id = $1")
            .bind(pod_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn pending_count(&self, pod_id: i64) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE pod_id = $1")
            .bind(pod_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
