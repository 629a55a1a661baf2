use async_trait::async_trait;
use sqlx::Postgres;
use uuid::Uuid;

use peerpod_core::models::{Author, JobId, JobType, MediaRecord, NewRecord, PropagationMessage, Tag};
use peerpod_core::AppError;

use crate::db::transaction::PgMediaTx;
use crate::store_traits::MediaTransaction;

const RECORD_SELECT: &str = r#"
    SELECT
        r.id,
        r.uuid,
        r.ownership,
        r.origin_pod_id,
        r.name,
        r.category,
        r.licence,
        r.language,
        r.nsfw,
        r.description,
        r.duration,
        r.extname,
        r.views,
        r.author_id,
        a.name AS author_name,
        ARRAY(
            SELECT t.name
            FROM record_tags rt
            JOIN tags t ON t.id = rt.tag_id
            WHERE rt.record_id = r.id
            ORDER BY rt.position
        ) AS tags,
        r.sequence,
        r.created_at,
        r.updated_at
    FROM media_records r
    JOIN authors a ON a.id = r.author_id
"#;

impl PgMediaTx {
    async fn link_tags(&mut self, record_id: i64, tags: &[Tag]) -> Result<(), AppError> {
        sqlx::query("DELETE FROM record_tags WHERE record_id = $1")
            .bind(record_id)
            .execute(&mut *self.0)
            .await?;

        for (position, tag) in tags.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO record_tags (record_id, tag_id, position)
                VALUES ($1, $2, $3)
                ON CONFLICT (record_id, tag_id) DO NOTHING
                "#,
            )
            .bind(record_id)
            .bind(tag.id)
            .bind(position as i32)
            .execute(&mut *self.0)
            .await?;
        }

        Ok(())
    }

    async fn load_inserted(&mut self, uuid: Uuid) -> Result<MediaRecord, AppError> {
        self.get_record(uuid)
            .await?
            .ok_or_else(|| AppError::Internal(format!("Record {} vanished inside its transaction", uuid)))
    }
}

#[async_trait]
impl MediaTransaction for PgMediaTx {
    #[tracing::instrument(skip(self))]
    async fn find_or_create_author(
        &mut self,
        name: &str,
        pod_id: Option<i64>,
        user_id: Option<i64>,
    ) -> Result<Author, AppError> {
        let existing = sqlx::query_as::<Postgres, Author>(
            r#"
            SELECT id, name, pod_id, user_id, created_at
            FROM authors
            WHERE name = $1 AND pod_id IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(name)
        .bind(pod_id)
        .fetch_optional(&mut *self.0)
        .await?;

        if let Some(author) = existing {
            return Ok(author);
        }

        let author = sqlx::query_as::<Postgres, Author>(
            r#"
            INSERT INTO authors (name, pod_id, user_id)
            VALUES ($1, $2, $3)
            RETURNING id, name, pod_id, user_id, created_at
            "#,
        )
        .bind(name)
        .bind(pod_id)
        .bind(user_id)
        .fetch_one(&mut *self.0)
        .await?;

        tracing::debug!(author_id = author.id, "Author created");
        Ok(author)
    }

    #[tracing::instrument(skip(self))]
    async fn find_or_create_tags(&mut self, names: &[String]) -> Result<Vec<Tag>, AppError> {
        let mut tags = Vec::with_capacity(names.len());
        for name in names {
            let existing = sqlx::query_as::<Postgres, Tag>("SELECT id, name FROM tags WHERE name = $1")
                .bind(name)
                .fetch_optional(&mut *self.0)
                .await?;

            let tag = match existing {
                Some(tag) => tag,
                None => {
                    sqlx::query_as::<Postgres, Tag>(
                        "INSERT INTO tags (name) VALUES ($1) RETURNING id, name",
                    )
                    .bind(name)
                    .fetch_one(&mut *self.0)
                    .await?
                }
            };
            tags.push(tag);
        }
        Ok(tags)
    }

    async fn get_record(&mut self, uuid: Uuid) -> Result<Option<MediaRecord>, AppError> {
        let query = format!("{} WHERE r.uuid = $1", RECORD_SELECT);
        let record = sqlx::query_as::<Postgres, MediaRecord>(&query)
            .bind(uuid)
            .fetch_optional(&mut *self.0)
            .await?;
        Ok(record)
    }

    #[tracing::instrument(skip(self, record, tags), fields(record.uuid = %record.uuid))]
    async fn insert_record(
        &mut self,
        record: &NewRecord,
        tags: &[Tag],
    ) -> Result<MediaRecord, AppError> {
        let (record_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO media_records (
                uuid, ownership, origin_pod_id, name, category, licence, language, nsfw,
                description, duration, extname, views, author_id, sequence, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING id
            "#,
        )
        .bind(record.uuid)
        .bind(record.ownership.to_string())
        .bind(record.origin_pod_id)
        .bind(&record.name)
        .bind(record.category)
        .bind(record.licence)
        .bind(record.language)
        .bind(record.nsfw)
        .bind(&record.description)
        .bind(record.duration)
        .bind(&record.extname)
        .bind(record.views)
        .bind(record.author_id)
        .bind(record.sequence)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&mut *self.0)
        .await?;

        self.link_tags(record_id, tags).await?;
        self.load_inserted(record.uuid).await
    }

    #[tracing::instrument(skip(self, record, tags), fields(record.uuid = %record.uuid, sequence = record.sequence))]
    async fn update_record(
        &mut self,
        record: &MediaRecord,
        tags: &[Tag],
    ) -> Result<MediaRecord, AppError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE media_records
            SET name = $2,
                category = $3,
                licence = $4,
                language = $5,
                nsfw = $6,
                description = $7,
                duration = $8,
                extname = $9,
                views = $10,
                author_id = $11,
                sequence = $12,
                updated_at = $13
            WHERE uuid = $1
            RETURNING id
            "#,
        )
        .bind(record.uuid)
        .bind(&record.name)
        .bind(record.category)
        .bind(record.licence)
        .bind(record.language)
        .bind(record.nsfw)
        .bind(&record.description)
        .bind(record.duration)
        .bind(&record.extname)
        .bind(record.views)
        .bind(record.author_id)
        .bind(record.sequence)
        .bind(record.updated_at)
        .fetch_optional(&mut *self.0)
        .await?;

        let (record_id,) =
            row.ok_or_else(|| AppError::NotFound(format!("Record {} not found", record.uuid)))?;

        self.link_tags(record_id, tags).await?;
        self.load_inserted(record.uuid).await
    }

    #[tracing::instrument(skip(self))]
    async fn delete_record(&mut self, uuid: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM media_records WHERE uuid = $1")
            .bind(uuid)
            .execute(&mut *self.0)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn increment_views(
        &mut self,
        uuid: Uuid,
        by: i64,
    ) -> Result<Option<(i64, i64)>, AppError> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            r#"
            UPDATE media_records
            SET views = views + $2, sequence = sequence + 1
            WHERE uuid = $1
            RETURNING views, sequence
            "#,
        )
        .bind(uuid)
        .bind(by)
        .fetch_optional(&mut *self.0)
        .await?;
        Ok(row)
    }

    async fn set_views(&mut self, uuid: Uuid, views: i64) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE media_records SET views = $2 WHERE uuid = $1 AND ownership = 'remote'",
        )
        .bind(uuid)
        .bind(views)
        .execute(&mut *self.0)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn advance_replica_sequence(
        &mut self,
        origin_pod_id: i64,
        record_uuid: Uuid,
        sequence: i64,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO replica_sequences (origin_pod_id, record_uuid, sequence)
            VALUES ($1, $2, $3)
            ON CONFLICT (origin_pod_id, record_uuid) DO UPDATE
            SET sequence = EXCLUDED.sequence, updated_at = NOW()
            WHERE replica_sequences.sequence < EXCLUDED.sequence
            "#,
        )
        .bind(origin_pod_id)
        .bind(record_uuid)
        .bind(sequence)
        .execute(&mut *self.0)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self))]
    async fn blacklist_record(&mut self, uuid: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO blacklisted_records (record_id)
            SELECT id FROM media_records WHERE uuid = $1
            ON CONFLICT (record_id) DO NOTHING
            "#,
        )
        .bind(uuid)
        .execute(&mut *self.0)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_blacklisted(&mut self, uuid: Uuid) -> Result<bool, AppError> {
        let (blacklisted,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM blacklisted_records b
                JOIN media_records r ON r.id = b.record_id
                WHERE r.uuid = $1
            )
            "#,
        )
        .bind(uuid)
        .fetch_one(&mut *self.0)
        .await?;
        Ok(blacklisted)
    }

    /// The pod check keeps a peer removed mid-transaction from getting an orphan entry.
    #[tracing::instrument(skip(self, message), fields(record.uuid = %message.record_uuid, sequence = message.sequence))]
    async fn enqueue_message(
        &mut self,
        pod_id: i64,
        message: &PropagationMessage,
    ) -> Result<bool, AppError> {
        let payload = serde_json::to_value(message)?;
        let result = sqlx::query(
            r#"
            INSERT INTO outbox (pod_id, record_uuid, sequence, message)
            SELECT $1, $2, $3, $4
            WHERE EXISTS (SELECT 1 FROM pods WHERE id = $1)
            "#,
        )
        .bind(pod_id)
        .bind(message.record_uuid)
        .bind(message.sequence)
        .bind(payload)
        .execute(&mut *self.0)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn next_event_sequence(&mut self, record_uuid: Uuid) -> Result<i64, AppError> {
        let (sequence,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO event_sequences (record_uuid, sequence)
            VALUES ($1, 1)
            ON CONFLICT (record_uuid) DO UPDATE
            SET sequence = event_sequences.sequence + 1
            RETURNING sequence
            "#,
        )
        .bind(record_uuid)
        .fetch_one(&mut *self.0)
        .await?;
        Ok(sequence)
    }

    #[tracing::instrument(skip(self, payload))]
    async fn insert_job(
        &mut self,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<JobId, AppError> {
        let (id,): (JobId,) = sqlx::query_as(
            r#"
            INSERT INTO jobs (id, job_type, state, payload)
            VALUES ($1, $2, 'pending', $3)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_type.to_string())
        .bind(payload)
        .fetch_one(&mut *self.0)
        .await?;
        Ok(id)
    }
}
