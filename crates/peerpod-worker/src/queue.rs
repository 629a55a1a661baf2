//! Job queue: per-type dispatchers, bounded concurrency, and submission.
//!
//! Every job is persisted as Pending before `enqueue` returns. Each registered job
//! type gets its own dispatcher loop that claims Pending jobs oldest first, marks
//! them Active and hands them to the type's handler, never running more than the
//! type's concurrency limit at once. Dispatchers wake on enqueue, on a finished
//! job, or on the poll interval.
//!
//! There is no automatic retry: a failed `process` leaves the job Failed until
//! someone calls [`JobQueue::retry_failed`]. The final state write itself is retried
//! a few times; `on_success` / `on_error` only run once it has persisted. A job whose
//! state could not be written stays Active and is dispatched again on the next start.
//!
//! Shutdown: [`JobQueue::shutdown`] stops the dispatchers from claiming new jobs and
//! waits for their loops to exit. Each dispatcher owns the tasks of the jobs it
//! claimed and waits for them before exiting, so in-flight jobs run to completion.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::sleep;

use peerpod_core::models::{Job, JobId, JobPayload, JobState, JobType};
use peerpod_core::AppError;
use peerpod_db::JobStore;

use crate::handler::JobHandler;

/// Optional sender notified with the final state of every job, after its
/// `on_success` / `on_error` callback returned.
pub type JobFinishedSender = mpsc::Sender<(JobId, JobState)>;

const STATE_WRITE_ATTEMPTS: u32 = 3;
const STATE_WRITE_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct JobQueueConfig {
    pub poll_interval_ms: u64,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    wakeup: Arc<Notify>,
}

pub struct JobQueue {
    store: Arc<dyn JobStore>,
    config: JobQueueConfig,
    registrations: Mutex<HashMap<JobType, Registration>>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    job_finished_tx: Option<JobFinishedSender>,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        config: JobQueueConfig,
        job_finished_tx: Option<JobFinishedSender>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            config,
            registrations: Mutex::new(HashMap::new()),
            dispatchers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shutdown_tx,
            job_finished_tx,
        }
    }

    /// Register the handler for a job type. Before `start` a later registration for
    /// the same type replaces the earlier one. After `start` a new type gets its
    /// dispatcher right away, and a type that already has one is rejected.
    pub fn register_handler(
        &self,
        job_type: JobType,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> Result<(), AppError> {
        let registration = Registration {
            handler,
            concurrency: concurrency.max(1),
            wakeup: Arc::new(Notify::new()),
        };

        let started = {
            let mut registrations = self.lock_registrations();
            let started = self.started.load(Ordering::SeqCst);
            if started && registrations.contains_key(&job_type) {
                return Err(AppError::Validation(format!(
                    "A {} handler is already running",
                    job_type
                )));
            }
            if registrations
                .insert(job_type, registration.clone())
                .is_some()
            {
                tracing::warn!(job_type = %job_type, "Job handler replaced");
            }
            started
        };

        tracing::info!(
            job_type = %job_type,
            concurrency = registration.concurrency,
            "Job handler registered"
        );

        if started {
            self.spawn_dispatcher(job_type, registration);
        }
        Ok(())
    }

    /// Reset jobs interrupted by a previous crash and start one dispatcher per
    /// registered type.
    pub async fn start(&self) -> Result<(), AppError> {
        // Flipped under the registrations lock, so every handler is either in this
        // snapshot or sees `started` and spawns its own dispatcher.
        let registrations: Vec<(JobType, Registration)> = {
            let registrations = self.lock_registrations();
            if self.started.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            registrations.iter().map(|(t, r)| (*t, r.clone())).collect()
        };

        let types: Vec<JobType> = registrations.iter().map(|(t, _)| *t).collect();
        let recovered = self.store.recover_interrupted(&types).await?;
        if recovered > 0 {
            tracing::warn!(
                recovered,
                "Reset jobs left Active by a previous run; they will be dispatched again"
            );
        }

        for (job_type, registration) in registrations {
            self.spawn_dispatcher(job_type, registration);
        }

        tracing::info!(
            poll_interval_ms = self.config.poll_interval_ms,
            "Job queue started"
        );
        Ok(())
    }

    /// Persist a Pending job and wake its dispatcher.
    #[tracing::instrument(skip(self, payload))]
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<JobId, AppError> {
        let job = self.store.create_job(job_type, payload).await.map_err(|e| {
            tracing::error!(error = %e, job_type = %job_type, "Failed to persist job");
            e
        })?;

        self.wake(job_type);
        tracing::info!(job.id = %job.id, job_type = %job_type, "Job enqueued");
        Ok(job.id)
    }

    /// Enqueue a typed payload under its own job type.
    pub async fn enqueue_payload<P: JobPayload>(&self, payload: &P) -> Result<JobId, AppError> {
        let value = serde_json::to_value(payload)?;
        self.enqueue(P::job_type(), value).await
    }

    /// Put a Failed job back in line as a fresh Pending job.
    #[tracing::instrument(skip(self))]
    pub async fn retry_failed(&self, job_id: JobId) -> Result<Job, AppError> {
        match self.store.retry_failed(job_id).await? {
            Some(job) => {
                self.wake(job.job_type);
                tracing::info!(job.id = %job.id, "Failed job re-enqueued");
                Ok(job)
            }
            None => match self.store.get_job(job_id).await? {
                Some(job) => Err(AppError::Validation(format!(
                    "Job {} is {}, only failed jobs can be retried",
                    job_id, job.state
                ))),
                None => Err(AppError::NotFound(format!("Job {} not found", job_id))),
            },
        }
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, AppError> {
        self.store.get_job(job_id).await
    }

    pub async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>, AppError> {
        self.store.list_jobs(state, limit).await
    }

    /// Prune Completed and Failed jobs that finished before `before`.
    pub async fn delete_finished_before(&self, before: DateTime<Utc>) -> Result<u64, AppError> {
        let deleted = self.store.delete_finished_before(before).await?;
        if deleted > 0 {
            tracing::info!(deleted, "Pruned finished jobs");
        }
        Ok(deleted)
    }

    /// Stop claiming new jobs and wait for the dispatcher loops to exit.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating job queue shutdown");
        self.shutdown_tx.send_replace(true);

        let handles: Vec<JoinHandle<()>> = match self.dispatchers.lock() {
            Ok(mut dispatchers) => dispatchers.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Job dispatcher ended abnormally");
            }
        }
        tracing::info!("Job queue stopped");
    }

    fn lock_registrations(&self) -> std::sync::MutexGuard<'_, HashMap<JobType, Registration>> {
        match self.registrations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Nudge the dispatcher of `job_type`, e.g. after a job was inserted in a
    /// transaction that has now committed.
    pub fn wake(&self, job_type: JobType) {
        if let Some(registration) = self.lock_registrations().get(&job_type) {
            registration.wakeup.notify_one();
        }
    }

    fn spawn_dispatcher(&self, job_type: JobType, registration: Registration) {
        let dispatcher = Dispatcher {
            store: self.store.clone(),
            job_type,
            handler: registration.handler,
            semaphore: Arc::new(Semaphore::new(registration.concurrency)),
            wakeup: registration.wakeup,
            job_finished_tx: self.job_finished_tx.clone(),
        };
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(dispatcher.run(poll_interval, shutdown_rx));
        match self.dispatchers.lock() {
            Ok(mut dispatchers) => dispatchers.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }
}

/// Claims and runs the jobs of one type.
#[derive(Clone)]
struct Dispatcher {
    store: Arc<dyn JobStore>,
    job_type: JobType,
    handler: Arc<dyn JobHandler>,
    semaphore: Arc<Semaphore>,
    wakeup: Arc<Notify>,
    job_finished_tx: Option<JobFinishedSender>,
}

impl Dispatcher {
    async fn run(self, poll_interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(
            job_type = %self.job_type,
            concurrency = self.semaphore.available_permits(),
            "Job dispatcher started"
        );

        let mut jobs = JoinSet::new();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.claim_available(&mut jobs).await;

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                    self.reap(joined);
                }
                _ = self.wakeup.notified() => {}
                _ = sleep(poll_interval) => {}
            }
        }

        if !jobs.is_empty() {
            tracing::info!(
                job_type = %self.job_type,
                in_flight = jobs.len(),
                "Waiting for in-flight jobs"
            );
        }
        while let Some(joined) = jobs.join_next().await {
            self.reap(joined);
        }

        tracing::info!(job_type = %self.job_type, "Job dispatcher stopped");
    }

    fn reap(&self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            tracing::error!(error = %e, job_type = %self.job_type, "Job task ended abnormally");
        }
    }

    /// Claim jobs while permits are free and Pending jobs remain.
    async fn claim_available(&self, jobs: &mut JoinSet<()>) {
        loop {
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::trace!(job_type = %self.job_type, "Concurrency limit reached");
                    return;
                }
            };

            match self.store.claim_next(self.job_type).await {
                Ok(Some(job)) => {
                    let dispatcher = self.clone();
                    jobs.spawn(async move {
                        dispatcher.run_job(job, permit).await;
                    });
                }
                Ok(None) => {
                    tracing::trace!(job_type = %self.job_type, "No pending jobs");
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, job_type = %self.job_type, "Failed to claim job");
                    return;
                }
            }
        }
    }

    #[tracing::instrument(skip(self, job, permit), fields(job.id = %job.id, job.type = %job.job_type, attempts = job.attempts))]
    async fn run_job(&self, job: Job, permit: OwnedSemaphorePermit) {
        let final_state = match self.handler.process(&job).await {
            Ok(value) => {
                let persisted = self
                    .write_state("completed", || self.store.mark_completed(job.id, value.clone()))
                    .await;
                if !persisted {
                    drop(permit);
                    self.wakeup.notify_one();
                    return;
                }
                tracing::info!("Job completed");

                if let Err(e) = self.handler.on_success(job.id, &value).await {
                    tracing::warn!(error = %e, "Job success callback failed; job stays completed");
                }
                JobState::Completed
            }
            Err(err) => {
                tracing::error!(
                    error = %err,
                    retryable = err.is_retryable(),
                    "Job processing failed"
                );
                let persisted = self
                    .write_state("failed", || self.store.mark_failed(job.id, err.to_json()))
                    .await;
                if !persisted {
                    drop(permit);
                    self.wakeup.notify_one();
                    return;
                }
                self.handler.on_error(&err, job.id).await;
                JobState::Failed
            }
        };

        drop(permit);
        self.wakeup.notify_one();

        if let Some(ref tx) = self.job_finished_tx {
            let _ = tx.send((job.id, final_state)).await;
        }
    }

    /// Persist a final state, retrying briefly. On false the job is left Active
    /// and dispatched again on the next start.
    async fn write_state<F, Fut>(&self, state: &str, mut write: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), AppError>>,
    {
        for attempt in 1..=STATE_WRITE_ATTEMPTS {
            match write().await {
                Ok(()) => return true,
                Err(e) if attempt < STATE_WRITE_ATTEMPTS => {
                    tracing::warn!(
                        error = %e,
                        attempt,
                        state,
                        "Failed to persist job state, retrying"
                    );
                    sleep(STATE_WRITE_BACKOFF * attempt).await;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        state,
                        "Failed to persist job state; job stays active until the next start"
                    );
                }
            }
        }
        false
    }
}
