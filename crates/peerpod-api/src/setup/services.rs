//! Service wiring

use anyhow::{Context, Result};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use peerpod_core::models::JobType;
use peerpod_core::Config;
use peerpod_db::{JobRepository, OutboxRepository, PgTransactionalStore, PodRepository};
use peerpod_infra::{
    FederationBroker, FederationConfig, HttpTransport, InboundProcessor, PeerRegistry,
};
use peerpod_worker::{JobQueue, JobQueueConfig};

use crate::services::{FfmpegTranscoder, MutationOrchestrator, OrchestratorConfig};
use crate::state::AppState;
use crate::task_handlers::TranscodeHandler;

use super::Pod;

pub async fn initialize_services(config: &Config, pool: PgPool) -> Result<Pod> {
    let store = Arc::new(PgTransactionalStore::new(pool.clone()));
    let jobs = Arc::new(JobRepository::new(pool.clone()));
    let pods = Arc::new(PodRepository::new(pool.clone()));
    let outbox = Arc::new(OutboxRepository::new(pool.clone()));

    let transport = Arc::new(HttpTransport::new(Duration::from_secs(
        config.federation_delivery_timeout_seconds(),
    ))?);
    let broker = Arc::new(FederationBroker::new(
        pods.clone(),
        outbox,
        transport,
        Arc::new(PeerRegistry::new()),
        FederationConfig::from_config(config),
    ));

    let job_queue = Arc::new(JobQueue::new(
        jobs,
        JobQueueConfig {
            poll_interval_ms: config.job_queue_poll_interval_ms(),
        },
        None,
    ));

    let orchestrator = Arc::new(MutationOrchestrator::new(
        store,
        broker.clone(),
        job_queue.clone(),
        OrchestratorConfig {
            transcoding_enabled: config.transcoding_enabled(),
            tx_max_retries: config.tx_max_retries(),
        },
    ));

    if config.transcoding_enabled() {
        let transcoder = Arc::new(
            FfmpegTranscoder::new(config.ffmpeg_path().to_string())
                .context("Invalid ffmpeg configuration")?,
        );
        job_queue.register_handler(
            JobType::Transcode,
            Arc::new(TranscodeHandler::new(
                orchestrator.clone(),
                transcoder,
                config.videos_dir(),
            )),
            config.max_concurrent_transcodes(),
        )?;
    } else {
        tracing::info!("Transcoding disabled, records propagate on creation");
    }

    let inbound = Arc::new(InboundProcessor::new(pods, orchestrator.clone()));

    broker
        .start()
        .await
        .context("Failed to start federation broker")?;
    job_queue
        .start()
        .await
        .context("Failed to start job queue")?;

    let state = Arc::new(AppState {
        inbound,
        broker,
        job_queue,
        pool: Some(pool),
    });

    Ok(Pod {
        state,
        orchestrator,
    })
}
