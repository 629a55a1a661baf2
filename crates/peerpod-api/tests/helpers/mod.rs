//! Test helpers: assemble a pod on the in-memory store.
//!
//! Everything runs in-process. Peers are reached either through a
//! `RecordingTransport` (deliveries are captured) or through a `LoopbackTransport`
//! that hands each delivery straight to the receiving pod's inbound processor.

#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use peerpod_api::{MutationOrchestrator, OrchestratorConfig, TranscodeHandler, Transcoder};
use peerpod_core::models::{
    CreateRecordRequest, FileRef, JobId, JobState, JobType, MediaRecord, NewPod, OwnerRef,
    MessageBody, Ownership, Pod, PropagationMessage, RemoteRecord,
};
use peerpod_core::AppError;
use peerpod_db::test_helpers::MemoryStore;
use peerpod_db::PodStore;
use peerpod_infra::federation::signature::sign;
use peerpod_infra::federation::testing::RecordingTransport;
use peerpod_infra::{
    DeliveryError, FederationBroker, FederationConfig, InboundProcessor, PeerRegistry,
    PeerTransport, SignedDelivery,
};
use peerpod_worker::{JobQueue, JobQueueConfig};

pub const SHARED_SECRET: &str = "handshake-secret";

pub struct TestPod {
    pub host: String,
    pub store: MemoryStore,
    pub broker: Arc<FederationBroker>,
    pub job_queue: Arc<JobQueue>,
    pub orchestrator: Arc<MutationOrchestrator<MemoryStore>>,
    pub inbound: Arc<InboundProcessor>,
    pub finished_rx: mpsc::Receiver<(JobId, JobState)>,
}

pub struct PodOptions {
    pub host: String,
    pub transport: Arc<dyn PeerTransport>,
    pub transcoder: Option<Arc<dyn Transcoder>>,
    pub videos_dir: PathBuf,
    pub tx_max_retries: u32,
}

impl PodOptions {
    pub fn new(host: &str, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            host: host.to_string(),
            transport,
            transcoder: None,
            videos_dir: std::env::temp_dir(),
            tx_max_retries: 5,
        }
    }
}

pub fn federation_config(host: &str) -> FederationConfig {
    FederationConfig {
        origin_host: host.to_string(),
        max_delivery_attempts: 5,
        delivery_timeout: Duration::from_millis(500),
        retry_base: Duration::from_millis(5),
        retry_max: Duration::from_millis(50),
        poll_interval: Duration::from_millis(20),
    }
}

pub fn build_pod(options: PodOptions) -> TestPod {
    let store = MemoryStore::new();
    let broker = Arc::new(FederationBroker::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        options.transport,
        Arc::new(PeerRegistry::new()),
        federation_config(&options.host),
    ));

    let (finished_tx, finished_rx) = mpsc::channel(32);
    let job_queue = Arc::new(JobQueue::new(
        Arc::new(store.clone()),
        JobQueueConfig {
            poll_interval_ms: 20,
        },
        Some(finished_tx),
    ));

    let orchestrator = Arc::new(MutationOrchestrator::new(
        Arc::new(store.clone()),
        broker.clone(),
        job_queue.clone(),
        OrchestratorConfig {
            transcoding_enabled: options.transcoder.is_some(),
            tx_max_retries: options.tx_max_retries,
        },
    ));

    if let Some(transcoder) = options.transcoder {
        job_queue.register_handler(
            JobType::Transcode,
            Arc::new(TranscodeHandler::new(
                orchestrator.clone(),
                transcoder,
                options.videos_dir,
            )),
            2,
        )
        .unwrap();
    }

    let inbound = Arc::new(InboundProcessor::new(
        Arc::new(store.clone()),
        orchestrator.clone(),
    ));

    TestPod {
        host: options.host,
        store,
        broker,
        job_queue,
        orchestrator,
        inbound,
        finished_rx,
    }
}

impl TestPod {
    /// Befriend `host` with the shared test secret.
    pub async fn befriend(&self, host: &str) -> Pod {
        self.broker
            .add_peer(NewPod {
                host: host.to_string(),
                shared_secret: SHARED_SECRET.to_string(),
            })
            .await
            .unwrap()
    }

    pub async fn peer(&self, host: &str) -> Pod {
        self.store.find_by_host(host).await.unwrap().unwrap()
    }

    pub async fn start(&self) {
        self.broker.start().await.unwrap();
        self.job_queue.start().await.unwrap();
    }

    pub async fn shutdown(&self) {
        self.job_queue.shutdown().await;
        self.broker.shutdown().await;
    }

    /// Messages waiting in the outbox for `pod_id`, in delivery order.
    pub fn queued(&self, pod_id: i64) -> Vec<PropagationMessage> {
        self.store
            .outbox_for(pod_id)
            .into_iter()
            .map(|entry| serde_json::from_value(entry.message).unwrap())
            .collect()
    }

    pub async fn next_finished(&mut self) -> (JobId, JobState) {
        tokio::time::timeout(Duration::from_secs(5), self.finished_rx.recv())
            .await
            .expect("job did not finish in time")
            .expect("job queue dropped the channel")
    }
}

pub fn create_request(name: &str) -> CreateRecordRequest {
    CreateRecordRequest {
        name: name.to_string(),
        category: 3,
        licence: 1,
        language: Some(2),
        nsfw: false,
        description: "Filmed on a Sunday".to_string(),
        tags: vec!["Cats".to_string(), "garden".to_string()],
    }
}

pub fn upload(extname: &str) -> FileRef {
    FileRef {
        path: format!("/uploads/tmp{}", extname),
        extname: extname.to_string(),
        duration: 42,
    }
}

pub fn owner() -> OwnerRef {
    OwnerRef {
        user_id: 7,
        username: "alice".to_string(),
    }
}

/// An owned record with committed sequence `sequence`, for seeding.
pub fn owned_record(uuid: Uuid, author_id: i64, sequence: i64) -> MediaRecord {
    let now = Utc::now();
    MediaRecord {
        id: 1,
        uuid,
        ownership: Ownership::Owned,
        origin_pod_id: None,
        name: "seed".to_string(),
        category: 1,
        licence: 1,
        language: None,
        nsfw: false,
        description: String::new(),
        duration: 10,
        extname: ".mp4".to_string(),
        views: 0,
        author_id,
        author_name: "alice".to_string(),
        tags: Vec::new(),
        sequence,
        created_at: now,
        updated_at: now,
    }
}

/// A replica of a record owned by `origin_pod_id`.
pub fn remote_record(uuid: Uuid, origin_pod_id: i64, sequence: i64) -> MediaRecord {
    MediaRecord {
        ownership: Ownership::Remote,
        origin_pod_id: Some(origin_pod_id),
        author_name: "bob".to_string(),
        ..owned_record(uuid, 99, sequence)
    }
}

/// A message body and its signature under the shared test secret.
pub fn signed(message: &PropagationMessage) -> (Vec<u8>, String) {
    let body = serde_json::to_vec(message).unwrap();
    let signature = sign(&body, SHARED_SECRET).unwrap();
    (body, signature)
}

pub fn full_record_message(
    origin: &str,
    uuid: Uuid,
    sequence: i64,
    name: &str,
) -> PropagationMessage {
    let now = Utc::now();
    PropagationMessage {
        origin: origin.to_string(),
        sequence,
        record_uuid: uuid,
        body: MessageBody::FullRecord(RemoteRecord {
            uuid,
            name: name.to_string(),
            category: 1,
            licence: 1,
            language: None,
            nsfw: false,
            description: String::new(),
            duration: 12,
            extname: ".mp4".to_string(),
            views: 0,
            author: "bob".to_string(),
            tags: vec!["remote".to_string()],
            created_at: now,
            updated_at: now,
        }),
    }
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub fn recording_transport() -> Arc<RecordingTransport> {
    Arc::new(RecordingTransport::new())
}

/// Delivers straight into the receiving pod's inbound processor.
#[derive(Default)]
pub struct LoopbackTransport {
    inboxes: RwLock<HashMap<String, Arc<InboundProcessor>>>,
}

impl LoopbackTransport {
    pub fn connect(&self, host: &str, inbound: Arc<InboundProcessor>) {
        self.inboxes
            .write()
            .unwrap()
            .insert(host.to_string(), inbound);
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn deliver(&self, pod: &Pod, delivery: &SignedDelivery) -> Result<(), DeliveryError> {
        let inbound = self
            .inboxes
            .read()
            .unwrap()
            .get(&pod.host)
            .cloned()
            .ok_or_else(|| DeliveryError::Unreachable(pod.host.clone()))?;

        match inbound
            .accept(&delivery.origin, Some(&delivery.signature), &delivery.body)
            .await
        {
            Ok(_) => Ok(()),
            Err(AppError::Unauthorized(_)) => Err(DeliveryError::Rejected { status: 401 }),
            Err(AppError::Validation(_)) | Err(AppError::NotFound(_)) => {
                Err(DeliveryError::Rejected { status: 400 })
            }
            Err(_) => Err(DeliveryError::Rejected { status: 500 }),
        }
    }
}

/// Transcoder double. Optionally waits for a gate before finishing, or fails.
#[derive(Default)]
pub struct FakeTranscoder {
    pub calls: AtomicUsize,
    pub gate: Option<Arc<Notify>>,
    pub fail: AtomicBool,
}

impl FakeTranscoder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode(&self, _input: &Path, output: &Path) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ref gate) = self.gate {
            gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("encoder crashed"));
        }
        tokio::fs::write(output, b"mp4").await?;
        Ok(())
    }
}
