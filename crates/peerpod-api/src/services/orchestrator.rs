//! Mutation orchestrator
//!
//! Single entry point for every change to media records. Each mutation runs as a
//! unit of work inside the transaction retry executor, and whatever it causes is
//! written in that same transaction:
//!
//! - a create with transcoding enabled inserts a Transcode job, and the job
//!   propagates the record once it is done,
//! - every other change hands a [`MutationEvent`] to the broker, which stages the
//!   outbox entries.
//!
//! A rolled-back attempt leaves neither entries nor jobs behind. After the commit
//! the orchestrator only wakes the senders and dispatchers that have new work.
//!
//! Owned records change only here. Remote records change only through
//! [`MutationOrchestrator::apply_inbound`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use peerpod_core::constants::TRANSCODED_EXTNAME;
use peerpod_core::models::{
    normalize_tags, CreateRecordRequest, EventType, FileRef, JobId, JobPayload, MediaRecord,
    MessageBody, MutationEvent, NewRecord, Ownership, OwnerRef, RecordPatch, RecordRef,
    RemoteRecord, TranscodePayload,
};
use peerpod_core::AppError;
use peerpod_db::{execute, MediaTransaction, RetryOptions, TransactionalStore, UnitOfWork};
use peerpod_infra::{
    FederationBroker, InboundApplier, InboundOutcome, StagedDelivery, VerifiedMessage,
};
use peerpod_worker::JobQueue;

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub transcoding_enabled: bool,
    pub tx_max_retries: u32,
}

pub struct MutationOrchestrator<S> {
    store: Arc<S>,
    broker: Arc<FederationBroker>,
    job_queue: Arc<JobQueue>,
    config: OrchestratorConfig,
}

impl<S> MutationOrchestrator<S>
where
    S: TransactionalStore + 'static,
    S::Tx: MediaTransaction,
{
    pub fn new(
        store: Arc<S>,
        broker: Arc<FederationBroker>,
        job_queue: Arc<JobQueue>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            broker,
            job_queue,
            config,
        }
    }

    /// Create an owned record for an uploaded file.
    #[tracing::instrument(skip(self, request, file, owner), fields(record.uuid = tracing::field::Empty, owner = %owner.username))]
    pub async fn create_record(
        &self,
        request: CreateRecordRequest,
        file: FileRef,
        owner: OwnerRef,
    ) -> Result<MediaRecord, AppError> {
        request.validate()?;
        if !file.extname.starts_with('.') || file.extname.len() < 2 {
            return Err(AppError::Validation(format!(
                "Invalid file extension '{}'",
                file.extname
            )));
        }
        if file.duration < 0 {
            return Err(AppError::Validation("Duration cannot be negative".to_string()));
        }

        let work = CreateRecord {
            uuid: Uuid::new_v4(),
            request,
            file,
            owner,
            transcode: self.config.transcoding_enabled,
            broker: &self.broker,
        };
        tracing::Span::current().record("record.uuid", work.uuid.to_string());

        let committed = execute(
            self.store.as_ref(),
            self.options("Failed to create record", ()),
            &work,
        )
        .await?;
        let (record, job_id, staged) = committed.value;

        match job_id {
            Some(job_id) => {
                self.job_queue.wake(TranscodePayload::job_type());
                tracing::info!(job.id = %job_id, "Record created, transcoding queued");
            }
            None => {
                self.broker.wake(&staged);
                tracing::info!(peers = staged.len(), "Record created");
            }
        }

        Ok(record)
    }

    /// Apply a metadata patch to an owned record.
    #[tracing::instrument(skip(self, patch), fields(record.uuid = %uuid))]
    pub async fn update_record(
        &self,
        uuid: Uuid,
        patch: RecordPatch,
    ) -> Result<MediaRecord, AppError> {
        patch.validate()?;
        if patch.is_empty() {
            return Err(AppError::Validation("Nothing to update".to_string()));
        }

        let current = self.require_owned(uuid).await?;

        let committed = execute(
            self.store.as_ref(),
            self.options("Failed to update record", current),
            &UpdateRecord {
                uuid,
                patch,
                broker: &self.broker,
            },
        )
        .await?;

        let (record, staged) = committed.value;
        self.broker.wake(&staged);
        tracing::info!(
            sequence = record.sequence,
            attempts = committed.attempts,
            "Record updated"
        );
        Ok(record)
    }

    /// Delete an owned record and tell peers to drop their replicas.
    #[tracing::instrument(skip(self), fields(record.uuid = %uuid))]
    pub async fn delete_record(&self, uuid: Uuid) -> Result<(), AppError> {
        let committed = execute(
            self.store.as_ref(),
            self.options("Failed to delete record", ()),
            &DeleteRecord {
                uuid,
                broker: &self.broker,
            },
        )
        .await?;

        let (record, staged) = committed.value;
        self.broker.wake(&staged);
        tracing::info!(sequence = record.sequence, "Record deleted");
        Ok(())
    }

    /// Count a view. Owned records bump their counter and notify peers; a replica
    /// only forwards the view to its owner. Blacklisted replicas are not viewable.
    #[tracing::instrument(skip(self), fields(record.uuid = %uuid))]
    pub async fn view_record(&self, uuid: Uuid) -> Result<RemoteRecord, AppError> {
        let committed = execute(
            self.store.as_ref(),
            self.options("Failed to count view", ()),
            &ViewRecord {
                uuid,
                broker: &self.broker,
            },
        )
        .await?;

        let (record, staged) = committed.value;
        self.broker.wake(&staged);
        Ok(record.to_remote())
    }

    /// Hide a replica from this pod. Only records owned by another pod can be
    /// blacklisted; the entry is local and never propagated. Returns false when the
    /// record was already blacklisted.
    #[tracing::instrument(skip(self), fields(record.uuid = %uuid))]
    pub async fn blacklist_record(&self, uuid: Uuid) -> Result<bool, AppError> {
        let committed = execute(
            self.store.as_ref(),
            self.options("Failed to blacklist record", ()),
            &BlacklistRecord { uuid },
        )
        .await?;

        if committed.value {
            tracing::info!("Record blacklisted");
        }
        Ok(committed.value)
    }

    pub async fn get_record(&self, uuid: Uuid) -> Result<Option<MediaRecord>, AppError> {
        let committed = execute(
            self.store.as_ref(),
            self.options("Failed to load record", ()),
            &LoadRecord { uuid },
        )
        .await?;
        Ok(committed.value)
    }

    /// Switch an owned record to its transcoded file. A record already carrying the
    /// transcoded extension is returned unchanged.
    #[tracing::instrument(skip(self), fields(record.uuid = %uuid))]
    pub async fn mark_transcoded(&self, uuid: Uuid) -> Result<MediaRecord, AppError> {
        let committed = execute(
            self.store.as_ref(),
            self.options("Failed to store transcoded file", ()),
            &MarkTranscoded { uuid },
        )
        .await?;
        Ok(committed.value)
    }

    /// Queue the current state of an owned record for every peer.
    pub async fn propagate_record(&self, uuid: Uuid) -> Result<(), AppError> {
        let committed = execute(
            self.store.as_ref(),
            self.options("Failed to propagate record", ()),
            &PropagateRecord {
                uuid,
                broker: &self.broker,
            },
        )
        .await?;
        self.broker.wake(&committed.value);
        Ok(())
    }

    /// Apply an authenticated message from a peer.
    #[tracing::instrument(skip(self, verified), fields(pod.id = verified.pod.id, record.uuid = %verified.message.record_uuid, sequence = verified.message.sequence, kind = verified.message.body.kind()))]
    pub async fn apply_inbound(
        &self,
        verified: VerifiedMessage,
    ) -> Result<InboundOutcome, AppError> {
        let work = ApplyInbound {
            broker: &self.broker,
            origin_pod_id: verified.pod.id,
            sequence: verified.message.sequence,
            record_uuid: verified.message.record_uuid,
            body: verified.message.body,
        };

        let committed = execute(
            self.store.as_ref(),
            self.options("Failed to apply inbound message", ()),
            &work,
        )
        .await?;

        let (outcome, staged) = committed.value;
        self.broker.wake(&staged);
        Ok(outcome)
    }

    async fn require_owned(&self, uuid: Uuid) -> Result<MediaRecord, AppError> {
        let record = self
            .get_record(uuid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Record {} not found", uuid)))?;
        ensure_owned(&record)?;
        Ok(record)
    }

    fn options<A>(&self, message: &str, arguments: A) -> RetryOptions<A> {
        RetryOptions::new(message, arguments).with_max_retries(self.config.tx_max_retries)
    }
}

#[async_trait]
impl<S> InboundApplier for MutationOrchestrator<S>
where
    S: TransactionalStore + 'static,
    S::Tx: MediaTransaction,
{
    async fn apply_inbound(&self, message: VerifiedMessage) -> Result<InboundOutcome, AppError> {
        MutationOrchestrator::apply_inbound(self, message).await
    }
}

fn ensure_owned(record: &MediaRecord) -> Result<(), AppError> {
    if record.is_owned() {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "Record {} belongs to another pod and cannot be modified here",
            record.uuid
        )))
    }
}

/// `now`, or just after `previous` when the clock has not moved past it.
fn next_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

async fn get_owned<T: MediaTransaction>(tx: &mut T, uuid: Uuid) -> Result<MediaRecord, AppError> {
    let record = tx
        .get_record(uuid)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Record {} not found", uuid)))?;
    ensure_owned(&record)?;
    Ok(record)
}

/// With transcoding on, the record is only propagated once the job has produced
/// the transcoded file.
struct CreateRecord<'a> {
    uuid: Uuid,
    request: CreateRecordRequest,
    file: FileRef,
    owner: OwnerRef,
    transcode: bool,
    broker: &'a FederationBroker,
}

#[async_trait]
impl<T: MediaTransaction> UnitOfWork<T, ()> for CreateRecord<'_> {
    type Output = (MediaRecord, Option<JobId>, StagedDelivery);

    async fn run(
        &self,
        tx: &mut T,
        _args: &mut (),
    ) -> Result<(MediaRecord, Option<JobId>, StagedDelivery), AppError> {
        let author = tx
            .find_or_create_author(&self.owner.username, None, Some(self.owner.user_id))
            .await?;
        let tags = tx
            .find_or_create_tags(&normalize_tags(&self.request.tags))
            .await?;

        let now = Utc::now();
        let record = NewRecord {
            uuid: self.uuid,
            ownership: Ownership::Owned,
            origin_pod_id: None,
            name: self.request.name.clone(),
            category: self.request.category,
            licence: self.request.licence,
            language: self.request.language,
            nsfw: self.request.nsfw,
            description: self.request.description.clone(),
            duration: self.file.duration,
            extname: self.file.extname.clone(),
            views: 0,
            author_id: author.id,
            sequence: 1,
            created_at: now,
            updated_at: now,
        };
        let record = tx.insert_record(&record, &tags).await?;

        if self.transcode {
            let payload = serde_json::to_value(TranscodePayload {
                record_uuid: record.uuid,
            })?;
            let job_id = tx.insert_job(TranscodePayload::job_type(), payload).await?;
            return Ok((record, Some(job_id), StagedDelivery::default()));
        }

        let staged = self
            .broker
            .handle_event(tx, MutationEvent::Upserted(Box::new(record.clone())))
            .await?;
        Ok((record, None, staged))
    }
}

/// Each attempt starts from the record as committed, so concurrent patches
/// serialize instead of overwriting each other.
struct UpdateRecord<'a> {
    uuid: Uuid,
    patch: RecordPatch,
    broker: &'a FederationBroker,
}

#[async_trait]
impl<T: MediaTransaction> UnitOfWork<T, MediaRecord> for UpdateRecord<'_> {
    type Output = (MediaRecord, StagedDelivery);

    async fn run(
        &self,
        tx: &mut T,
        record: &mut MediaRecord,
    ) -> Result<(MediaRecord, StagedDelivery), AppError> {
        *record = get_owned(tx, self.uuid).await?;

        record.apply_patch(&self.patch);
        record.sequence += 1;
        record.updated_at = next_timestamp(record.updated_at);

        let tags = tx.find_or_create_tags(&record.tags).await?;
        let updated = tx.update_record(record, &tags).await?;
        let staged = self
            .broker
            .handle_event(tx, MutationEvent::Upserted(Box::new(updated.clone())))
            .await?;
        Ok((updated, staged))
    }
}

struct DeleteRecord<'a> {
    uuid: Uuid,
    broker: &'a FederationBroker,
}

#[async_trait]
impl<T: MediaTransaction> UnitOfWork<T, ()> for DeleteRecord<'_> {
    type Output = (RecordRef, StagedDelivery);

    async fn run(
        &self,
        tx: &mut T,
        _args: &mut (),
    ) -> Result<(RecordRef, StagedDelivery), AppError> {
        let record = get_owned(tx, self.uuid).await?;
        tx.delete_record(self.uuid).await?;
        let removed = RecordRef {
            sequence: record.sequence + 1,
            ..record.record_ref()
        };
        let staged = self
            .broker
            .handle_event(tx, MutationEvent::Removed { record: removed })
            .await?;
        Ok((removed, staged))
    }
}

struct ViewRecord<'a> {
    uuid: Uuid,
    broker: &'a FederationBroker,
}

#[async_trait]
impl<T: MediaTransaction> UnitOfWork<T, ()> for ViewRecord<'_> {
    type Output = (MediaRecord, StagedDelivery);

    async fn run(
        &self,
        tx: &mut T,
        _args: &mut (),
    ) -> Result<(MediaRecord, StagedDelivery), AppError> {
        let not_found = || AppError::NotFound(format!("Record {} not found", self.uuid));
        let mut record = tx.get_record(self.uuid).await?.ok_or_else(not_found)?;

        let event = if record.is_owned() {
            let (views, sequence) = tx
                .increment_views(self.uuid, 1)
                .await?
                .ok_or_else(not_found)?;
            record.views = views;
            record.sequence = sequence;
            MutationEvent::Viewed {
                record: record.record_ref(),
                views,
            }
        } else {
            if tx.is_blacklisted(self.uuid).await? {
                return Err(not_found());
            }
            MutationEvent::RemoteViewed {
                record: record.record_ref(),
            }
        };

        let staged = self.broker.handle_event(tx, event).await?;
        Ok((record, staged))
    }
}

struct BlacklistRecord {
    uuid: Uuid,
}

#[async_trait]
impl<T: MediaTransaction> UnitOfWork<T, ()> for BlacklistRecord {
    type Output = bool;

    async fn run(&self, tx: &mut T, _args: &mut ()) -> Result<bool, AppError> {
        let record = tx
            .get_record(self.uuid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Record {} not found", self.uuid)))?;
        if record.is_owned() {
            return Err(AppError::Validation(
                "Cannot blacklist a local record".to_string(),
            ));
        }
        tx.blacklist_record(self.uuid).await
    }
}

struct PropagateRecord<'a> {
    uuid: Uuid,
    broker: &'a FederationBroker,
}

#[async_trait]
impl<T: MediaTransaction> UnitOfWork<T, ()> for PropagateRecord<'_> {
    type Output = StagedDelivery;

    async fn run(&self, tx: &mut T, _args: &mut ()) -> Result<StagedDelivery, AppError> {
        let record = tx
            .get_record(self.uuid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Record {} not found", self.uuid)))?;
        self.broker
            .handle_event(tx, MutationEvent::Upserted(Box::new(record)))
            .await
    }
}

struct LoadRecord {
    uuid: Uuid,
}

#[async_trait]
impl<T: MediaTransaction> UnitOfWork<T, ()> for LoadRecord {
    type Output = Option<MediaRecord>;

    async fn run(&self, tx: &mut T, _args: &mut ()) -> Result<Option<MediaRecord>, AppError> {
        tx.get_record(self.uuid).await
    }
}

struct MarkTranscoded {
    uuid: Uuid,
}

#[async_trait]
impl<T: MediaTransaction> UnitOfWork<T, ()> for MarkTranscoded {
    type Output = MediaRecord;

    async fn run(&self, tx: &mut T, _args: &mut ()) -> Result<MediaRecord, AppError> {
        let mut record = get_owned(tx, self.uuid).await?;
        if record.extname == TRANSCODED_EXTNAME {
            return Ok(record);
        }

        record.extname = TRANSCODED_EXTNAME.to_string();
        // Still at 1 means creation deferred propagation to this job, so peers have
        // never seen the record and the first version they get is 1.
        if record.sequence > 1 {
            record.sequence += 1;
        }
        record.updated_at = next_timestamp(record.updated_at);

        let tags = tx.find_or_create_tags(&record.tags).await?;
        tx.update_record(&record, &tags).await
    }
}

struct ApplyInbound<'a> {
    broker: &'a FederationBroker,
    origin_pod_id: i64,
    sequence: i64,
    record_uuid: Uuid,
    body: MessageBody,
}

impl ApplyInbound<'_> {
    /// Create or overwrite the local replica from the owner's full record.
    async fn upsert_replica<T: MediaTransaction>(
        &self,
        tx: &mut T,
        existing: Option<MediaRecord>,
        remote: &RemoteRecord,
    ) -> Result<(), AppError> {
        let author = tx
            .find_or_create_author(&remote.author, Some(self.origin_pod_id), None)
            .await?;
        let tag_names = normalize_tags(&remote.tags);
        let tags = tx.find_or_create_tags(&tag_names).await?;

        match existing {
            Some(mut record) => {
                record.name = remote.name.clone();
                record.category = remote.category;
                record.licence = remote.licence;
                record.language = remote.language;
                record.nsfw = remote.nsfw;
                record.description = remote.description.clone();
                record.duration = remote.duration;
                record.extname = remote.extname.clone();
                record.views = remote.views;
                record.author_id = author.id;
                record.author_name = author.name;
                record.tags = tag_names;
                record.sequence = self.sequence;
                record.updated_at = remote.updated_at;
                tx.update_record(&record, &tags).await?;
            }
            None => {
                let record = NewRecord {
                    uuid: self.record_uuid,
                    ownership: Ownership::Remote,
                    origin_pod_id: Some(self.origin_pod_id),
                    name: remote.name.clone(),
                    category: remote.category,
                    licence: remote.licence,
                    language: remote.language,
                    nsfw: remote.nsfw,
                    description: remote.description.clone(),
                    duration: remote.duration,
                    extname: remote.extname.clone(),
                    views: remote.views,
                    author_id: author.id,
                    sequence: self.sequence,
                    created_at: remote.created_at,
                    updated_at: remote.updated_at,
                };
                tx.insert_record(&record, &tags).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T: MediaTransaction> UnitOfWork<T, ()> for ApplyInbound<'_> {
    type Output = (InboundOutcome, StagedDelivery);

    async fn run(
        &self,
        tx: &mut T,
        _args: &mut (),
    ) -> Result<(InboundOutcome, StagedDelivery), AppError> {
        let existing = tx.get_record(self.record_uuid).await?;

        if let MessageBody::Event(event) = &self.body {
            let record = existing.ok_or_else(|| {
                AppError::NotFound(format!("Record {} not found", self.record_uuid))
            })?;
            if !record.is_owned() {
                return Err(AppError::Validation(format!(
                    "Record {} is not owned by this pod",
                    self.record_uuid
                )));
            }
            if !tx
                .advance_replica_sequence(self.origin_pod_id, self.record_uuid, self.sequence)
                .await?
            {
                return Ok((InboundOutcome::Discarded, StagedDelivery::default()));
            }

            return match event.event_type {
                EventType::View => {
                    let (views, sequence) = tx
                        .increment_views(self.record_uuid, event.count)
                        .await?
                        .ok_or_else(|| {
                            AppError::NotFound(format!("Record {} not found", self.record_uuid))
                        })?;
                    let event = MutationEvent::Viewed {
                        record: RecordRef {
                            sequence,
                            ..record.record_ref()
                        },
                        views,
                    };
                    let staged = self.broker.handle_event(tx, event).await?;
                    Ok((InboundOutcome::Applied, staged))
                }
            };
        }

        if let Some(record) = &existing {
            if record.is_owned() {
                return Err(AppError::Validation(format!(
                    "Record {} is owned by this pod",
                    self.record_uuid
                )));
            }
            if record.origin_pod_id != Some(self.origin_pod_id) {
                return Err(AppError::Unauthorized(format!(
                    "Record {} is owned by another pod",
                    self.record_uuid
                )));
            }
        }

        // A counter update for a replica we never received has nothing to land on.
        if existing.is_none() && matches!(self.body, MessageBody::QuickUpdate(_)) {
            return Ok((InboundOutcome::Discarded, StagedDelivery::default()));
        }

        if !tx
            .advance_replica_sequence(self.origin_pod_id, self.record_uuid, self.sequence)
            .await?
        {
            return Ok((InboundOutcome::Discarded, StagedDelivery::default()));
        }

        match &self.body {
            MessageBody::FullRecord(remote) => {
                self.upsert_replica(tx, existing, remote).await?;
            }
            MessageBody::QuickUpdate(update) => {
                if let Some(views) = update.views {
                    tx.set_views(self.record_uuid, views).await?;
                }
            }
            MessageBody::Remove => {
                if existing.is_some() {
                    tx.delete_record(self.record_uuid).await?;
                }
            }
            MessageBody::Event(_) => {}
        }

        Ok((InboundOutcome::Applied, StagedDelivery::default()))
    }
}
