use async_trait::async_trait;
use sqlx::{PgPool, Postgres};

use peerpod_core::constants::POD_SCORE_INITIAL;
use peerpod_core::models::{NewPod, Pod};
use peerpod_core::AppError;

use crate::store_traits::PodStore;

#[derive(Clone)]
pub struct PodRepository {
    pool: PgPool,
}

impl PodRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PodStore for PodRepository {
    #[tracing::instrument(skip(self, pod), fields(pod.host = %pod.host))]
    async fn insert_pod(&self, pod: &NewPod) -> Result<Pod, AppError> {
        let pod = sqlx::query_as::<Postgres, Pod>(
            r#"
            INSERT INTO pods (host, shared_secret, score)
            VALUES ($1, $2, $3)
            RETURNING id, host, shared_secret, score, last_seen_at, created_at
            "#,
        )
        .bind(&pod.host)
        .bind(&pod.shared_secret)
        .bind(POD_SCORE_INITIAL)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Validation(format!("Pod {} is already a friend", pod.host))
            }
            other => AppError::Database(other),
        })?;

        Ok(pod)
    }

    #[tracing::instrument(skip(self))]
    async fn delete_pod(&self, id: i64) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM pods WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, AppError> {
        let pods = sqlx::query_as::<Postgres, Pod>(
            r#"
            SELECT id, host, shared_secret, score, last_seen_at, created_at
            FROM pods
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(pods)
    }

    async fn find_by_host(&self, host: &str) -> Result<Option<Pod>, AppError> {
        let pod = sqlx::query_as::<Postgres, Pod>(
            r#"
            SELECT id, host, shared_secret, score, last_seen_at, created_at
            FROM pods
            WHERE host = $1
            "#,
        )
        .bind(host)
        .fetch_optional(&self.pool)
        .await?;
        Ok(pod)
    }

    async fn adjust_score(&self, id: i64, delta: i32, max: i32) -> Result<Option<i32>, AppError> {
        let score: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE pods
            SET score = LEAST(GREATEST(score + $2, 0), $3)
            WHERE id = $1
            RETURNING score
            "#,
        )
        .bind(id)
        .bind(delta)
        .bind(max)
        .fetch_optional(&self.pool)
        .await?;
        Ok(score.map(|(s,)| s))
    }

    async fn touch_last_seen(&self, id: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE pods SET last_seen_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
