//! Store trait abstractions
//!
//! Services talk to persistence through these traits so they can run against the
//! Postgres repositories in production and the in-memory store in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use peerpod_core::models::{
    Author, Job, JobId, JobState, JobType, MediaRecord, NewPod, NewRecord, OutboxEntry, Pod,
    PropagationMessage, Tag,
};
use peerpod_core::AppError;
use uuid::Uuid;

/// Operations available inside an open transaction.
///
/// Besides records, a mutation writes its outbox entries and follow-up jobs here,
/// so they commit or roll back together with the change that caused them.
#[async_trait]
pub trait MediaTransaction: Send {
    /// Author for `(name, pod_id)`, created on first use.
    async fn find_or_create_author(
        &mut self,
        name: &str,
        pod_id: Option<i64>,
        user_id: Option<i64>,
    ) -> Result<Author, AppError>;

    /// Tags for the given names, creating the missing ones.
    async fn find_or_create_tags(&mut self, names: &[String]) -> Result<Vec<Tag>, AppError>;

    async fn get_record(&mut self, uuid: Uuid) -> Result<Option<MediaRecord>, AppError>;

    async fn insert_record(
        &mut self,
        record: &NewRecord,
        tags: &[Tag],
    ) -> Result<MediaRecord, AppError>;

    /// Persist every mutable column of `record` and replace its tag links.
    async fn update_record(
        &mut self,
        record: &MediaRecord,
        tags: &[Tag],
    ) -> Result<MediaRecord, AppError>;

    async fn delete_record(&mut self, uuid: Uuid) -> Result<bool, AppError>;

    /// Add `by` views and bump the record's sequence. Returns the new
    /// `(views, sequence)`, or None when the record does not exist.
    async fn increment_views(&mut self, uuid: Uuid, by: i64)
        -> Result<Option<(i64, i64)>, AppError>;

    /// Overwrite the view counter of a replica with the owner's value.
    async fn set_views(&mut self, uuid: Uuid, views: i64) -> Result<bool, AppError>;

    /// Record `sequence` as the last accepted one for `(origin_pod_id, record_uuid)`.
    /// Returns false, leaving the stored value alone, when `sequence` is not greater.
    async fn advance_replica_sequence(
        &mut self,
        origin_pod_id: i64,
        record_uuid: Uuid,
        sequence: i64,
    ) -> Result<bool, AppError>;

    /// Hide a record from this pod's viewers. Returns false when it already was.
    async fn blacklist_record(&mut self, uuid: Uuid) -> Result<bool, AppError>;

    async fn is_blacklisted(&mut self, uuid: Uuid) -> Result<bool, AppError>;

    /// Append `message` to the peer's queue. Returns false when the pod is no
    /// longer registered.
    async fn enqueue_message(
        &mut self,
        pod_id: i64,
        message: &PropagationMessage,
    ) -> Result<bool, AppError>;

    /// Next value of this pod's event counter for a record it does not own.
    async fn next_event_sequence(&mut self, record_uuid: Uuid) -> Result<i64, AppError>;

    /// Persist a Pending job.
    async fn insert_job(
        &mut self,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<JobId, AppError>;
}

/// Persistence of the job queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<Job, AppError>;

    /// Oldest Pending job of `job_type`, switched to Active with `attempts + 1`.
    async fn claim_next(&self, job_type: JobType) -> Result<Option<Job>, AppError>;

    async fn mark_completed(&self, id: JobId, result: serde_json::Value) -> Result<(), AppError>;

    async fn mark_failed(&self, id: JobId, error: serde_json::Value) -> Result<(), AppError>;

    /// Reset Active jobs of the given types to Pending. Returns how many were reset.
    async fn recover_interrupted(&self, job_types: &[JobType]) -> Result<u64, AppError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, AppError>;

    async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>, AppError>;

    /// Put a Failed job back to Pending. None when the job is missing or not Failed.
    async fn retry_failed(&self, id: JobId) -> Result<Option<Job>, AppError>;

    async fn delete_finished_before(&self, before: DateTime<Utc>) -> Result<u64, AppError>;
}

/// Persistence of the friend pod registry.
#[async_trait]
pub trait PodStore: Send + Sync {
    async fn insert_pod(&self, pod: &NewPod) -> Result<Pod, AppError>;

    async fn delete_pod(&self, id: i64) -> Result<bool, AppError>;

    async fn list_pods(&self) -> Result<Vec<Pod>, AppError>;

    async fn find_by_host(&self, host: &str) -> Result<Option<Pod>, AppError>;

    /// Move the score by `delta`, clamped to `0..=max`. Returns the new score.
    async fn adjust_score(&self, id: i64, delta: i32, max: i32) -> Result<Option<i32>, AppError>;

    async fn touch_last_seen(&self, id: i64) -> Result<(), AppError>;
}

/// Per-peer outbound queues. Entries are written through
/// [`MediaTransaction::enqueue_message`]; this side drains them.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Oldest entry in the peer's queue, whether or not it is due yet.
    async fn head(&self, pod_id: i64) -> Result<Option<OutboxEntry>, AppError>;

    /// Remove an entry (acknowledged or given up on).
    async fn remove(&self, entry_id: i64) -> Result<(), AppError>;

    async fn record_failure(
        &self,
        entry_id: i64,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), AppError>;

    /// Drop every pending entry of a peer.
    async fn purge_pod(&self, pod_id: i64) -> Result<u64, AppError>;

    async fn pending_count(&self, pod_id: i64) -> Result<i64, AppError>;
}
