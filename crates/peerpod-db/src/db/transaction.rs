//! Database transaction utilities
//!
//! `execute` runs a unit of work inside a SERIALIZABLE transaction and replays it
//! from scratch when the store reports a serialization conflict. The store is the
//! only arbiter of conflicting writes; nothing here takes application locks.
//!
//! Each attempt:
//! 1. snapshots the caller's arguments,
//! 2. begins a transaction and runs the work against it,
//! 3. commits on success.
//!
//! Any failed attempt (work error, rollback, failed commit) restores the arguments
//! before deciding whether to retry, so a later attempt or the caller never sees
//! state left behind by a failed one.

use async_trait::async_trait;
use peerpod_core::constants::DEFAULT_TX_MAX_RETRIES;
use peerpod_core::models::MediaRecord;
use peerpod_core::AppError;
use sqlx::{PgPool, Postgres, Transaction};

/// A store that hands out transactions with SERIALIZABLE semantics.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx, AppError>;

    /// Commit. A serialization failure detected at commit time must surface as an
    /// error for which `AppError::is_conflict` holds.
    async fn commit(&self, tx: Self::Tx) -> Result<(), AppError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), AppError>;
}

/// The body of a transaction. It receives the same arguments on every attempt.
#[async_trait]
pub trait UnitOfWork<Tx: Send, A: Send>: Send + Sync {
    type Output: Send;

    async fn run(&self, tx: &mut Tx, args: &mut A) -> Result<Self::Output, AppError>;
}

/// Arguments that can be rewound to their state before an attempt.
pub trait AttemptSnapshot {
    type Snapshot: Send;

    fn snapshot(&self) -> Self::Snapshot;

    fn restore(&mut self, snapshot: Self::Snapshot);
}

impl AttemptSnapshot for () {
    type Snapshot = ();

    fn snapshot(&self) -> Self::Snapshot {}

    fn restore(&mut self, _snapshot: Self::Snapshot) {}
}

impl AttemptSnapshot for MediaRecord {
    type Snapshot = MediaRecord;

    fn snapshot(&self) -> Self::Snapshot {
        self.clone()
    }

    fn restore(&mut self, snapshot: Self::Snapshot) {
        *self = snapshot;
    }
}

#[derive(Debug, Clone)]
pub struct RetryOptions<A> {
    /// Retries after the first attempt; at most `max_retries + 1` attempts run.
    pub max_retries: u32,
    /// Reported with `RetriesExhausted` and in logs.
    pub error_message: String,
    pub arguments: A,
}

impl<A> RetryOptions<A> {
    pub fn new(error_message: impl Into<String>, arguments: A) -> Self {
        Self {
            max_retries: DEFAULT_TX_MAX_RETRIES,
            error_message: error_message.into(),
            arguments,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Outcome of a committed transaction.
#[derive(Debug)]
pub struct Committed<T, A> {
    pub value: T,
    /// Number of attempts, including the one that committed.
    pub attempts: u32,
    /// Arguments as left by the committed attempt.
    pub arguments: A,
}

/// Run `work` in a transaction, retrying on serialization conflicts.
///
/// Non-conflict errors are returned unchanged after the first failure.
/// When every attempt conflicts, `AppError::RetriesExhausted` carries
/// `error_message` and the last conflict.
pub async fn execute<S, A, W>(
    store: &S,
    options: RetryOptions<A>,
    work: &W,
) -> Result<Committed<W::Output, A>, AppError>
where
    S: TransactionalStore + ?Sized,
    A: AttemptSnapshot + Send,
    W: UnitOfWork<S::Tx, A> + ?Sized,
{
    let RetryOptions {
        max_retries,
        error_message,
        mut arguments,
    } = options;

    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        let snapshot = arguments.snapshot();

        let err = match run_attempt(store, work, &mut arguments).await {
            Ok(value) => {
                if attempts > 1 {
                    tracing::debug!(attempts, "Transaction committed after retries");
                }
                return Ok(Committed {
                    value,
                    attempts,
                    arguments,
                });
            }
            Err(err) => err,
        };

        arguments.restore(snapshot);

        if !err.is_conflict() {
            tracing::debug!(
                error = %err,
                attempts,
                context = %error_message,
                "Transaction aborted with a non-retryable error"
            );
            return Err(err);
        }

        if attempts > max_retries {
            tracing::error!(
                error = %err,
                attempts,
                "{}",
                error_message
            );
            return Err(AppError::RetriesExhausted {
                message: error_message,
                attempts,
                source: Box::new(err),
            });
        }

        tracing::debug!(
            error = %err,
            attempt = attempts,
            max_retries,
            "Serialization conflict, retrying transaction"
        );
    }
}

async fn run_attempt<S, A, W>(store: &S, work: &W, arguments: &mut A) -> Result<W::Output, AppError>
where
    S: TransactionalStore + ?Sized,
    A: Send,
    W: UnitOfWork<S::Tx, A> + ?Sized,
{
    let mut tx = store.begin().await?;

    match work.run(&mut tx, arguments).await {
        Ok(value) => {
            store.commit(tx).await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = store.rollback(tx).await {
                tracing::error!(
                    error = %rollback_err,
                    original_error = %e,
                    "Failed to rollback transaction"
                );
            }
            Err(e)
        }
    }
}

/// Postgres-backed transactional store.
#[derive(Clone)]
pub struct PgTransactionalStore {
    pool: PgPool,
}

/// An open SERIALIZABLE Postgres transaction.
pub struct PgMediaTx(pub(crate) Transaction<'static, Postgres>);

impl PgMediaTx {
    pub fn as_mut(&mut self) -> &mut Transaction<'static, Postgres> {
        &mut self.0
    }
}

impl PgTransactionalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionalStore for PgTransactionalStore {
    type Tx = PgMediaTx;

    async fn begin(&self) -> Result<Self::Tx, AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to begin transaction");
            AppError::Database(e)
        })?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        Ok(PgMediaTx(tx))
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), AppError> {
        tx.0.commit().await.map_err(|e| {
            let err = AppError::Database(e);
            if !err.is_conflict() {
                tracing::error!(error = %err, "Failed to commit transaction");
            }
            err
        })
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), AppError> {
        tx.0.rollback().await.map_err(AppError::Database)
    }
}
