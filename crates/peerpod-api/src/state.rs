use sqlx::PgPool;
use std::sync::Arc;

use peerpod_infra::{FederationBroker, InboundProcessor};
use peerpod_worker::JobQueue;

/// Shared state handed to the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub inbound: Arc<InboundProcessor>,
    pub broker: Arc<FederationBroker>,
    pub job_queue: Arc<JobQueue>,
    /// None when running against a non-Postgres store.
    pub pool: Option<PgPool>,
}
