//! Application setup and initialization
//!
//! Everything `main` needs, kept out of it so the wiring can be read in one place.

pub mod database;
pub mod routes;
pub mod server;
pub mod services;

use anyhow::{Context, Result};
use std::sync::Arc;

use peerpod_core::Config;
use peerpod_db::PgTransactionalStore;

use crate::services::MutationOrchestrator;
use crate::state::AppState;

/// The running pod: HTTP state plus the orchestrator for the client-facing layer.
pub struct Pod {
    pub state: Arc<AppState>,
    pub orchestrator: Arc<MutationOrchestrator<PgTransactionalStore>>,
}

impl Pod {
    /// Stop background work: no new jobs are claimed, peer senders stop.
    pub async fn shutdown(&self) {
        self.state.job_queue.shutdown().await;
        self.state.broker.shutdown().await;
    }
}

/// Initialize the entire application
pub async fn initialize_app(config: Config) -> Result<(Pod, axum::Router)> {
    config
        .validate()
        .context("Configuration validation failed")?;

    peerpod_infra::init_telemetry(config.is_production())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    tracing::info!(pod_host = %config.pod_host(), "Configuration loaded and validated successfully");

    let pool = database::setup_database(&config).await?;
    let pod = services::initialize_services(&config, pool).await?;
    let router = routes::setup_routes(pod.state.clone());

    Ok((pod, router))
}
