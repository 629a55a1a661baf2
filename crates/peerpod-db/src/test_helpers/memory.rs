//! In-memory store for tests
//!
//! Implements every store trait without a database. Record transactions use
//! optimistic concurrency: each transaction tracks the keys it read and wrote, and
//! commit fails with `AppError::Conflict` when any of them was committed by another
//! transaction after this one began. That rejects the same interleavings a
//! SERIALIZABLE Postgres transaction would.
//!
//! Outbox entries and jobs written inside a transaction are staged with it and
//! published at commit, under the same lock that applies the record writes, so
//! queue order follows commit order.
//!
//! Two knobs make conflicts deterministic:
//! - `inject_conflicts(n)` fails the next `n` commits,
//! - `hold_commits(n)` parks the next `n` writing commits until all of them arrived.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Barrier;
use uuid::Uuid;

use peerpod_core::constants::POD_SCORE_INITIAL;
use peerpod_core::models::{
    Author, Job, JobId, JobState, JobType, MediaRecord, NewPod, NewRecord, OutboxEntry, Pod,
    PropagationMessage, Tag,
};
use peerpod_core::AppError;

use crate::db::transaction::TransactionalStore;
use crate::store_traits::{JobStore, MediaTransaction, OutboxStore, PodStore};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Record(Uuid),
    Author(String, Option<i64>),
    Tag(String),
    Replica(i64, Uuid),
    EventSequence(Uuid),
    Blacklist(Uuid),
}

#[derive(Debug, Clone)]
enum Write {
    /// None deletes the record.
    Record(Option<MediaRecord>),
    Author(Author),
    Tag(Tag),
    Replica(i64),
    EventSequence(i64),
    Blacklist(bool),
}

#[derive(Default)]
struct CommittedState {
    records: HashMap<Uuid, MediaRecord>,
    authors: HashMap<(String, Option<i64>), Author>,
    tags: HashMap<String, Tag>,
    replica_sequences: HashMap<(i64, Uuid), i64>,
    event_sequences: HashMap<Uuid, i64>,
    blacklist: HashSet<Uuid>,
    key_versions: HashMap<Key, u64>,
    version: u64,
}

impl CommittedState {
    fn read(&self, key: &Key) -> Option<Write> {
        match key {
            Key::Record(uuid) => Some(Write::Record(self.records.get(uuid).cloned())),
            Key::Author(name, pod_id) => self
                .authors
                .get(&(name.clone(), *pod_id))
                .cloned()
                .map(Write::Author),
            Key::Tag(name) => self.tags.get(name).cloned().map(Write::Tag),
            Key::Replica(pod_id, uuid) => self
                .replica_sequences
                .get(&(*pod_id, *uuid))
                .copied()
                .map(Write::Replica),
            Key::EventSequence(uuid) => self
                .event_sequences
                .get(uuid)
                .copied()
                .map(Write::EventSequence),
            Key::Blacklist(uuid) => Some(Write::Blacklist(self.blacklist.contains(uuid))),
        }
    }

    fn apply(&mut self, key: Key, write: Write) {
        match (key, write) {
            (Key::Record(uuid), Write::Record(Some(record))) => {
                self.records.insert(uuid, record);
            }
            (Key::Record(uuid), Write::Record(None)) => {
                self.records.remove(&uuid);
            }
            (Key::Author(name, pod_id), Write::Author(author)) => {
                self.authors.insert((name, pod_id), author);
            }
            (Key::Tag(name), Write::Tag(tag)) => {
                self.tags.insert(name, tag);
            }
            (Key::Replica(pod_id, uuid), Write::Replica(sequence)) => {
                self.replica_sequences.insert((pod_id, uuid), sequence);
            }
            (Key::EventSequence(uuid), Write::EventSequence(sequence)) => {
                self.event_sequences.insert(uuid, sequence);
            }
            (Key::Blacklist(uuid), Write::Blacklist(true)) => {
                self.blacklist.insert(uuid);
            }
            (Key::Blacklist(uuid), Write::Blacklist(false)) => {
                self.blacklist.remove(&uuid);
            }
            (key, write) => panic!("mismatched write {:?} for key {:?}", write, key),
        }
    }
}

struct Inner {
    data: Mutex<CommittedState>,
    jobs: Mutex<Vec<Job>>,
    pods: Mutex<Vec<Pod>>,
    outbox: Mutex<Vec<OutboxEntry>>,
    next_id: AtomicI64,
    injected_conflicts: AtomicU32,
    commit_attempts: AtomicU32,
    commits: AtomicU32,
    rendezvous: Mutex<Option<(Arc<Barrier>, usize)>>,
}

/// In-memory implementation of every store trait.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(CommittedState::default()),
                jobs: Mutex::new(Vec::new()),
                pods: Mutex::new(Vec::new()),
                outbox: Mutex::new(Vec::new()),
                next_id: AtomicI64::new(1),
                injected_conflicts: AtomicU32::new(0),
                commit_attempts: AtomicU32::new(0),
                commits: AtomicU32::new(0),
                rendezvous: Mutex::new(None),
            }),
        }
    }

    fn next_id(&self) -> i64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Make the next `n` commits fail with a serialization conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.inner.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Park the next `n` writing commits until all `n` have arrived, so their
    /// transactions overlap. Read-only commits pass straight through.
    pub fn hold_commits(&self, n: usize) {
        *self.inner.rendezvous.lock().unwrap() = Some((Arc::new(Barrier::new(n)), n));
    }

    /// Commit calls so far, including the ones that failed.
    pub fn commit_attempts(&self) -> u32 {
        self.inner.commit_attempts.load(Ordering::SeqCst)
    }

    /// Commits that went through.
    pub fn commits(&self) -> u32 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// Store a record directly, outside any transaction.
    pub fn seed_record(&self, record: MediaRecord) {
        let mut data = self.inner.data.lock().unwrap();
        data.version += 1;
        let version = data.version;
        data.key_versions.insert(Key::Record(record.uuid), version);
        data.records.insert(record.uuid, record);
    }

    pub fn record(&self, uuid: Uuid) -> Option<MediaRecord> {
        self.inner.data.lock().unwrap().records.get(&uuid).cloned()
    }

    pub fn records(&self) -> Vec<MediaRecord> {
        self.inner
            .data
            .lock()
            .unwrap()
            .records
            .values()
            .cloned()
            .collect()
    }

    pub fn authors(&self) -> Vec<Author> {
        self.inner
            .data
            .lock()
            .unwrap()
            .authors
            .values()
            .cloned()
            .collect()
    }

    pub fn replica_sequence(&self, origin_pod_id: i64, record_uuid: Uuid) -> Option<i64> {
        self.inner
            .data
            .lock()
            .unwrap()
            .replica_sequences
            .get(&(origin_pod_id, record_uuid))
            .copied()
    }

    pub fn blacklisted(&self, uuid: Uuid) -> bool {
        self.inner.data.lock().unwrap().blacklist.contains(&uuid)
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.inner.jobs.lock().unwrap().clone()
    }

    /// Entries queued for a peer, in delivery order.
    pub fn outbox_for(&self, pod_id: i64) -> Vec<OutboxEntry> {
        self.inner
            .outbox
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.pod_id == pod_id)
            .cloned()
            .collect()
    }

    pub fn pod(&self, id: i64) -> Option<Pod> {
        self.inner
            .pods
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    /// Force a job into a state, e.g. to simulate a crash while Active.
    pub fn set_job_state(&self, id: JobId, state: JobState) {
        if let Some(job) = self.inner.jobs.lock().unwrap().iter_mut().find(|j| j.id == id) {
            job.state = state;
        }
    }

    fn take_rendezvous_slot(&self) -> Option<Arc<Barrier>> {
        let mut guard = self.inner.rendezvous.lock().unwrap();
        let (barrier, remaining) = guard.as_mut()?;
        let barrier = barrier.clone();
        *remaining -= 1;
        let last = *remaining == 0;
        if last {
            *guard = None;
        }
        Some(barrier)
    }
}

/// A transaction against `MemoryStore`.
pub struct MemoryTx {
    store: MemoryStore,
    begin_version: u64,
    reads: HashSet<Key>,
    writes: HashMap<Key, Write>,
    /// Entries get their id at commit.
    outbox: Vec<OutboxEntry>,
    jobs: Vec<Job>,
}

impl MemoryTx {
    fn has_writes(&self) -> bool {
        !self.writes.is_empty() || !self.outbox.is_empty() || !self.jobs.is_empty()
    }

    fn read(&mut self, key: Key) -> Option<Write> {
        if let Some(write) = self.writes.get(&key) {
            return Some(write.clone());
        }
        let value = self.store.inner.data.lock().unwrap().read(&key);
        self.reads.insert(key);
        value
    }

    fn write(&mut self, key: Key, write: Write) {
        self.writes.insert(key, write);
    }

    fn read_record(&mut self, uuid: Uuid) -> Option<MediaRecord> {
        match self.read(Key::Record(uuid)) {
            Some(Write::Record(record)) => record,
            _ => None,
        }
    }

    fn author_name(&self, author_id: i64) -> Option<String> {
        let pending = self.writes.values().find_map(|w| match w {
            Write::Author(a) if a.id == author_id => Some(a.name.clone()),
            _ => None,
        });
        pending.or_else(|| {
            self.store
                .inner
                .data
                .lock()
                .unwrap()
                .authors
                .values()
                .find(|a| a.id == author_id)
                .map(|a| a.name.clone())
        })
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<Self::Tx, AppError> {
        let begin_version = self.inner.data.lock().unwrap().version;
        Ok(MemoryTx {
            store: self.clone(),
            begin_version,
            reads: HashSet::new(),
            writes: HashMap::new(),
            outbox: Vec::new(),
            jobs: Vec::new(),
        })
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), AppError> {
        self.inner.commit_attempts.fetch_add(1, Ordering::SeqCst);

        if tx.has_writes() {
            if let Some(barrier) = self.take_rendezvous_slot() {
                barrier.wait().await;
            }
        }

        let injected = self.inner.injected_conflicts.load(Ordering::SeqCst);
        if injected > 0 {
            self.inner
                .injected_conflicts
                .store(injected - 1, Ordering::SeqCst);
            return Err(AppError::Conflict(
                "could not serialize access due to concurrent update".to_string(),
            ));
        }

        let mut data = self.inner.data.lock().unwrap();
        let touched = tx.reads.iter().chain(tx.writes.keys());
        for key in touched {
            if data.key_versions.get(key).copied().unwrap_or(0) > tx.begin_version {
                return Err(AppError::Conflict(format!(
                    "could not serialize access due to read/write dependencies ({:?})",
                    key
                )));
            }
        }

        if !tx.writes.is_empty() {
            data.version += 1;
            let version = data.version;
            for (key, write) in tx.writes {
                data.key_versions.insert(key.clone(), version);
                data.apply(key, write);
            }
        }

        if !tx.outbox.is_empty() {
            let pods = self.inner.pods.lock().unwrap();
            let mut outbox = self.inner.outbox.lock().unwrap();
            for mut entry in tx.outbox {
                // The peer was removed while this transaction ran.
                if !pods.iter().any(|p| p.id == entry.pod_id) {
                    continue;
                }
                entry.id = self.next_id();
                outbox.push(entry);
            }
        }
        self.inner.jobs.lock().unwrap().extend(tx.jobs);
        drop(data);

        self.inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, _tx: Self::Tx) -> Result<(), AppError> {
        Ok(())
    }
}

#[async_trait]
impl MediaTransaction for MemoryTx {
    async fn find_or_create_author(
        &mut self,
        name: &str,
        pod_id: Option<i64>,
        user_id: Option<i64>,
    ) -> Result<Author, AppError> {
        let key = Key::Author(name.to_string(), pod_id);
        if let Some(Write::Author(author)) = self.read(key.clone()) {
            return Ok(author);
        }
        let author = Author {
            id: self.store.next_id(),
            name: name.to_string(),
            pod_id,
            user_id,
            created_at: Utc::now(),
        };
        self.write(key, Write::Author(author.clone()));
        Ok(author)
    }

    async fn find_or_create_tags(&mut self, names: &[String]) -> Result<Vec<Tag>, AppError> {
        let mut tags = Vec::with_capacity(names.len());
        for name in names {
            let key = Key::Tag(name.clone());
            let tag = match self.read(key.clone()) {
                Some(Write::Tag(tag)) => tag,
                _ => {
                    let tag = Tag {
                        id: self.store.next_id(),
                        name: name.clone(),
                    };
                    self.write(key, Write::Tag(tag.clone()));
                    tag
                }
            };
            tags.push(tag);
        }
        Ok(tags)
    }

    async fn get_record(&mut self, uuid: Uuid) -> Result<Option<MediaRecord>, AppError> {
        Ok(self.read_record(uuid))
    }

    async fn insert_record(
        &mut self,
        record: &NewRecord,
        tags: &[Tag],
    ) -> Result<MediaRecord, AppError> {
        if self.read_record(record.uuid).is_some() {
            return Err(AppError::Validation(format!(
                "Record {} already exists",
                record.uuid
            )));
        }
        let author_name = self
            .author_name(record.author_id)
            .ok_or_else(|| AppError::NotFound(format!("Author {} not found", record.author_id)))?;

        let stored = MediaRecord {
            id: self.store.next_id(),
            uuid: record.uuid,
            ownership: record.ownership,
            origin_pod_id: record.origin_pod_id,
            name: record.name.clone(),
            category: record.category,
            licence: record.licence,
            language: record.language,
            nsfw: record.nsfw,
            description: record.description.clone(),
            duration: record.duration,
            extname: record.extname.clone(),
            views: record.views,
            author_id: record.author_id,
            author_name,
            tags: tags.iter().map(|t| t.name.clone()).collect(),
            sequence: record.sequence,
            created_at: record.created_at,
            updated_at: record.updated_at,
        };
        self.write(Key::Record(record.uuid), Write::Record(Some(stored.clone())));
        Ok(stored)
    }

    async fn update_record(
        &mut self,
        record: &MediaRecord,
        tags: &[Tag],
    ) -> Result<MediaRecord, AppError> {
        let current = self
            .read_record(record.uuid)
            .ok_or_else(|| AppError::NotFound(format!("Record {} not found", record.uuid)))?;

        let author_name = self
            .author_name(record.author_id)
            .unwrap_or_else(|| record.author_name.clone());
        let stored = MediaRecord {
            id: current.id,
            ownership: current.ownership,
            origin_pod_id: current.origin_pod_id,
            created_at: current.created_at,
            author_name,
            tags: tags.iter().map(|t| t.name.clone()).collect(),
            ..record.clone()
        };
        self.write(Key::Record(record.uuid), Write::Record(Some(stored.clone())));
        Ok(stored)
    }

    async fn delete_record(&mut self, uuid: Uuid) -> Result<bool, AppError> {
        if self.read_record(uuid).is_none() {
            return Ok(false);
        }
        self.write(Key::Record(uuid), Write::Record(None));
        self.write(Key::Blacklist(uuid), Write::Blacklist(false));
        Ok(true)
    }

    async fn increment_views(
        &mut self,
        uuid: Uuid,
        by: i64,
    ) -> Result<Option<(i64, i64)>, AppError> {
        let Some(mut record) = self.read_record(uuid) else {
            return Ok(None);
        };
        record.views += by;
        record.sequence += 1;
        let counters = (record.views, record.sequence);
        self.write(Key::Record(uuid), Write::Record(Some(record)));
        Ok(Some(counters))
    }

    async fn set_views(&mut self, uuid: Uuid, views: i64) -> Result<bool, AppError> {
        match self.read_record(uuid) {
            Some(mut record) if !record.is_owned() => {
                record.views = views;
                self.write(Key::Record(uuid), Write::Record(Some(record)));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn advance_replica_sequence(
        &mut self,
        origin_pod_id: i64,
        record_uuid: Uuid,
        sequence: i64,
    ) -> Result<bool, AppError> {
        let key = Key::Replica(origin_pod_id, record_uuid);
        let last = match self.read(key.clone()) {
            Some(Write::Replica(last)) => Some(last),
            _ => None,
        };
        if last.is_some_and(|last| sequence <= last) {
            return Ok(false);
        }
        self.write(key, Write::Replica(sequence));
        Ok(true)
    }

    async fn blacklist_record(&mut self, uuid: Uuid) -> Result<bool, AppError> {
        if self.read_record(uuid).is_none() || self.is_blacklisted(uuid).await? {
            return Ok(false);
        }
        self.write(Key::Blacklist(uuid), Write::Blacklist(true));
        Ok(true)
    }

    async fn is_blacklisted(&mut self, uuid: Uuid) -> Result<bool, AppError> {
        Ok(matches!(
            self.read(Key::Blacklist(uuid)),
            Some(Write::Blacklist(true))
        ))
    }

    async fn enqueue_message(
        &mut self,
        pod_id: i64,
        message: &PropagationMessage,
    ) -> Result<bool, AppError> {
        if self.store.pod(pod_id).is_none() {
            return Ok(false);
        }
        let now = Utc::now();
        self.outbox.push(OutboxEntry {
            id: 0,
            pod_id,
            record_uuid: message.record_uuid,
            sequence: message.sequence,
            message: serde_json::to_value(message)?,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
        });
        Ok(true)
    }

    async fn next_event_sequence(&mut self, record_uuid: Uuid) -> Result<i64, AppError> {
        let key = Key::EventSequence(record_uuid);
        let sequence = match self.read(key.clone()) {
            Some(Write::EventSequence(last)) => last + 1,
            _ => 1,
        };
        self.write(key, Write::EventSequence(sequence));
        Ok(sequence)
    }

    async fn insert_job(
        &mut self,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<JobId, AppError> {
        let job = Job {
            id: Uuid::new_v4(),
            job_type,
            state: JobState::Pending,
            payload,
            result: None,
            error: None,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let id = job.id;
        self.jobs.push(job);
        Ok(id)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<Job, AppError> {
        let job = Job {
            id: Uuid::new_v4(),
            job_type,
            state: JobState::Pending,
            payload,
            result: None,
            error: None,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.inner.jobs.lock().unwrap().push(job.clone());
        Ok(job)
    }

    async fn claim_next(&self, job_type: JobType) -> Result<Option<Job>, AppError> {
        let mut jobs = self.inner.jobs.lock().unwrap();
        let next = jobs
            .iter_mut()
            .find(|j| j.job_type == job_type && j.state == JobState::Pending);
        Ok(next.map(|job| {
            job.state = JobState::Active;
            job.attempts += 1;
            job.started_at = Some(Utc::now());
            job.clone()
        }))
    }

    async fn mark_completed(&self, id: JobId, result: serde_json::Value) -> Result<(), AppError> {
        let mut jobs = self.inner.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))?;
        job.state = JobState::Completed;
        job.result = Some(result);
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(&self, id: JobId, error: serde_json::Value) -> Result<(), AppError> {
        let mut jobs = self.inner.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))?;
        job.state = JobState::Failed;
        job.error = Some(error);
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn recover_interrupted(&self, job_types: &[JobType]) -> Result<u64, AppError> {
        let mut jobs = self.inner.jobs.lock().unwrap();
        let mut reset = 0;
        for job in jobs
            .iter_mut()
            .filter(|j| j.state == JobState::Active && job_types.contains(&j.job_type))
        {
            job.state = JobState::Pending;
            job.started_at = None;
            reset += 1;
        }
        Ok(reset)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, AppError> {
        Ok(self
            .inner
            .jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == id)
            .cloned())
    }

    async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>, AppError> {
        let jobs = self.inner.jobs.lock().unwrap();
        Ok(jobs
            .iter()
            .rev()
            .filter(|j| state.map_or(true, |s| j.state == s))
            .take(limit.clamp(1, 1000) as usize)
            .cloned()
            .collect())
    }

    async fn retry_failed(&self, id: JobId) -> Result<Option<Job>, AppError> {
        let mut jobs = self.inner.jobs.lock().unwrap();
        let Some(pos) = jobs
            .iter()
            .position(|j| j.id == id && j.state == JobState::Failed)
        else {
            return Ok(None);
        };
        let mut job = jobs.remove(pos);
        job.state = JobState::Pending;
        job.error = None;
        job.result = None;
        job.started_at = None;
        job.completed_at = None;
        job.created_at = Utc::now();
        jobs.push(job.clone());
        Ok(Some(job))
    }

    async fn delete_finished_before(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let mut jobs = self.inner.jobs.lock().unwrap();
        let len = jobs.len();
        jobs.retain(|j| !(j.state.is_finished() && j.completed_at.is_some_and(|c| c < before)));
        Ok((len - jobs.len()) as u64)
    }
}

#[async_trait]
impl PodStore for MemoryStore {
    async fn insert_pod(&self, pod: &NewPod) -> Result<Pod, AppError> {
        let mut pods = self.inner.pods.lock().unwrap();
        if pods.iter().any(|p| p.host == pod.host) {
            return Err(AppError::Validation(format!(
                "Pod {} is already a friend",
                pod.host
            )));
        }
        let pod = Pod {
            id: self.next_id(),
            host: pod.host.clone(),
            shared_secret: pod.shared_secret.clone(),
            score: POD_SCORE_INITIAL,
            last_seen_at: None,
            created_at: Utc::now(),
        };
        pods.push(pod.clone());
        Ok(pod)
    }

    async fn delete_pod(&self, id: i64) -> Result<bool, AppError> {
        let mut pods = self.inner.pods.lock().unwrap();
        let len = pods.len();
        pods.retain(|p| p.id != id);
        let removed = pods.len() != len;
        drop(pods);
        if removed {
            self.inner.outbox.lock().unwrap().retain(|e| e.pod_id != id);
        }
        Ok(removed)
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, AppError> {
        Ok(self.inner.pods.lock().unwrap().clone())
    }

    async fn find_by_host(&self, host: &str) -> Result<Option<Pod>, AppError> {
        Ok(self
            .inner
            .pods
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.host == host)
            .cloned())
    }

    async fn adjust_score(&self, id: i64, delta: i32, max: i32) -> Result<Option<i32>, AppError> {
        let mut pods = self.inner.pods.lock().unwrap();
        Ok(pods.iter_mut().find(|p| p.id == id).map(|pod| {
            pod.score = (pod.score + delta).clamp(0, max);
            pod.score
        }))
    }

    async fn touch_last_seen(&self, id: i64) -> Result<(), AppError> {
        if let Some(pod) = self
            .inner
            .pods
            .lock()
            .unwrap()
            .iter_mut()
            .find(|p| p.id == id)
        {
            pod.last_seen_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn head(&self, pod_id: i64) -> Result<Option<OutboxEntry>, AppError> {
        Ok(self
            .inner
            .outbox
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.pod_id == pod_id)
            .min_by_key(|e| e.id)
            .cloned())
    }

    async fn remove(&self, entry_id: i64) -> Result<(), AppError> {
        self.inner
            .outbox
            .lock()
            .unwrap()
            .retain(|e| e.id != entry_id);
        Ok(())
    }

    async fn record_failure(
        &self,
        entry_id: i64,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), AppError> {
        if let Some(entry) = self
            .inner
            .outbox
            .lock()
            .unwrap()
            .iter_mut()
            .find(|e| e.id == entry_id)
        {
            entry.attempts = attempts;
            entry.next_attempt_at = next_attempt_at;
            entry.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn purge_pod(&self, pod_id: i64) -> Result<u64, AppError> {
        let mut outbox = self.inner.outbox.lock().unwrap();
        let len = outbox.len();
        outbox.retain(|e| e.pod_id != pod_id);
        Ok((len - outbox.len()) as u64)
    }

    async fn pending_count(&self, pod_id: i64) -> Result<i64, AppError> {
        Ok(self
            .inner
            .outbox
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.pod_id == pod_id)
            .count() as i64)
    }
}
