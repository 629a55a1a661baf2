//! Federation broker
//!
//! Turns mutations into propagation messages and delivers them to friend pods.
//! Each message is written to the outbox of every addressed peer inside the
//! mutation's own transaction, so a change and its propagation commit together and
//! queue order follows commit order. A mutation never waits on the network: one
//! sender task per peer drains that peer's queue strictly in enqueue order, and the
//! head entry must be acknowledged (or given up on) before the next one is attempted.
//!
//! Delivery failures stay inside the broker. They push the entry's next attempt
//! back exponentially until `max_delivery_attempts` is reached, at which point the
//! entry is dropped.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, timeout};

use peerpod_core::constants::{POD_SCORE_BONUS, POD_SCORE_MALUS, POD_SCORE_MAX};
use peerpod_core::models::{
    EventType, MediaRecord, MessageBody, MutationEvent, NewPod, Ownership, OutboxEntry, Pod,
    PropagationMessage, QuickUpdate, RecordEvent, RecordRef,
};
use peerpod_core::{AppError, Config};
use peerpod_db::{MediaTransaction, OutboxStore, PodStore};

use super::backoff::retry_delay;
use super::registry::{PeerHandle, PeerRegistry};
use super::signature::sign;
use super::transport::{DeliveryError, PeerTransport, SignedDelivery};

#[derive(Clone, Debug)]
pub struct FederationConfig {
    /// Host this pod signs its messages as.
    pub origin_host: String,
    pub max_delivery_attempts: i32,
    pub delivery_timeout: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Idle senders re-check their queue at this interval.
    pub poll_interval: Duration,
}

impl FederationConfig {
    pub fn new(origin_host: impl Into<String>) -> Self {
        Self {
            origin_host: origin_host.into(),
            max_delivery_attempts: 10,
            delivery_timeout: Duration::from_secs(10),
            retry_base: Duration::from_millis(1000),
            retry_max: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(5000),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            origin_host: config.pod_host().to_string(),
            max_delivery_attempts: config.federation_max_delivery_attempts(),
            delivery_timeout: Duration::from_secs(config.federation_delivery_timeout_seconds()),
            retry_base: Duration::from_millis(config.federation_retry_base_ms()),
            retry_max: Duration::from_secs(config.federation_retry_max_seconds()),
            poll_interval: Duration::from_millis(config.federation_poll_interval_ms()),
        }
    }
}

/// Peers whose queues got entries in a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct StagedDelivery {
    pods: Vec<i64>,
}

impl StagedDelivery {
    pub fn pods(&self) -> &[i64] {
        &self.pods
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}

pub struct FederationBroker {
    pods: Arc<dyn PodStore>,
    outbox: Arc<dyn OutboxStore>,
    transport: Arc<dyn PeerTransport>,
    registry: Arc<PeerRegistry>,
    config: FederationConfig,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl FederationBroker {
    pub fn new(
        pods: Arc<dyn PodStore>,
        outbox: Arc<dyn OutboxStore>,
        transport: Arc<dyn PeerTransport>,
        registry: Arc<PeerRegistry>,
        config: FederationConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            pods,
            outbox,
            transport,
            registry,
            config,
            started: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn origin_host(&self) -> &str {
        &self.config.origin_host
    }

    /// Load the friend pods from the store and start one sender per peer. Entries
    /// left in the outbox by a previous run are delivered first.
    pub async fn start(&self) -> Result<(), AppError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for pod in self.pods.list_pods().await? {
            self.registry.insert(PeerHandle::new(pod));
        }

        self.registry.with_handles(|handles| {
            for handle in handles.values_mut() {
                if handle.task.is_none() {
                    handle.task = Some(self.spawn_sender(handle));
                }
            }
        });

        tracing::info!(peers = self.registry.len(), "Federation broker started");
        Ok(())
    }

    /// Stop every sender. In-flight deliveries finish; queued entries stay in the
    /// outbox for the next start.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating federation broker shutdown");
        self.shutdown_tx.send_replace(true);

        for handle in self.registry.drain() {
            if let Some(task) = handle.task {
                if let Err(e) = task.await {
                    tracing::error!(error = %e, pod.id = handle.pod.id, "Peer sender ended abnormally");
                }
            }
        }
        tracing::info!("Federation broker stopped");
    }

    /// Register a friend pod after a handshake. Nothing already propagated is
    /// replayed to it.
    #[tracing::instrument(skip(self, pod), fields(pod.host = %pod.host))]
    pub async fn add_peer(&self, pod: NewPod) -> Result<Pod, AppError> {
        if pod.host == self.config.origin_host {
            return Err(AppError::Validation(
                "A pod cannot befriend itself".to_string(),
            ));
        }

        let pod = self.pods.insert_pod(&pod).await?;
        let mut handle = PeerHandle::new(pod.clone());
        if self.started.load(Ordering::SeqCst) {
            handle.task = Some(self.spawn_sender(&handle));
        }
        self.registry.insert(handle);

        tracing::info!(pod.id = pod.id, "Peer added");
        Ok(pod)
    }

    /// Unfriend a pod: stop its sender and discard its pending messages. Other
    /// peers' queues are untouched.
    #[tracing::instrument(skip(self))]
    pub async fn remove_peer(&self, pod_id: i64) -> Result<bool, AppError> {
        let handle = self.registry.remove(pod_id);
        let registered = handle.is_some();

        if let Some(handle) = handle {
            handle.stop_tx.send_replace(true);
            if let Some(task) = handle.task {
                if let Err(e) = task.await {
                    tracing::error!(error = %e, pod.id = pod_id, "Peer sender ended abnormally");
                }
            }
        }

        let purged = self.outbox.purge_pod(pod_id).await?;
        let deleted = self.pods.delete_pod(pod_id).await?;

        tracing::info!(pod.id = pod_id, purged, "Peer removed");
        Ok(registered || deleted)
    }

    /// Write the propagation for `event` into the mutation's own transaction.
    /// Nothing is visible to the senders until that transaction commits; call
    /// [`FederationBroker::wake`] with the result afterwards.
    pub async fn handle_event<T: MediaTransaction>(
        &self,
        tx: &mut T,
        event: MutationEvent,
    ) -> Result<StagedDelivery, AppError> {
        match event {
            MutationEvent::Upserted(record) => self.propagate_full(tx, &record).await,
            MutationEvent::Viewed { record, views } => {
                self.propagate_quick_update(tx, record, QuickUpdate::views(views))
                    .await
            }
            MutationEvent::RemoteViewed { record } => {
                self.propagate_event(tx, record, EventType::View).await
            }
            MutationEvent::Removed { record } => self.propagate_remove(tx, record).await,
        }
    }

    /// Nudge the senders of peers that received entries in a committed transaction.
    pub fn wake(&self, staged: &StagedDelivery) {
        for pod_id in &staged.pods {
            self.registry.wake(*pod_id);
        }
    }

    /// Queue the record's full metadata for every peer.
    #[tracing::instrument(skip(self, tx, record), fields(record.uuid = %record.uuid, sequence = record.sequence))]
    pub async fn propagate_full<T: MediaTransaction>(
        &self,
        tx: &mut T,
        record: &MediaRecord,
    ) -> Result<StagedDelivery, AppError> {
        if !record.is_owned() {
            tracing::warn!("Refusing to propagate a record owned by another pod");
            return Ok(StagedDelivery::default());
        }
        let message = self.message(
            record.uuid,
            record.sequence,
            MessageBody::FullRecord(record.to_remote()),
        );
        self.fan_out(tx, &message, self.registry.pods()).await
    }

    /// Queue a counter update for every peer. `record.sequence` must be the sequence
    /// committed together with the new counter values.
    #[tracing::instrument(skip(self, tx, record, update), fields(record.uuid = %record.uuid, sequence = record.sequence))]
    pub async fn propagate_quick_update<T: MediaTransaction>(
        &self,
        tx: &mut T,
        record: RecordRef,
        update: QuickUpdate,
    ) -> Result<StagedDelivery, AppError> {
        if record.ownership != Ownership::Owned {
            tracing::warn!("Refusing to send a quick update for a record owned by another pod");
            return Ok(StagedDelivery::default());
        }
        if update.is_empty() {
            return Ok(StagedDelivery::default());
        }
        let message = self.message(record.uuid, record.sequence, MessageBody::QuickUpdate(update));
        self.fan_out(tx, &message, self.registry.pods()).await
    }

    /// Tell the owner of a replica that something happened to it here. The event
    /// sequence is drawn in `tx`, so concurrent events are numbered in commit order.
    #[tracing::instrument(skip(self, tx, record), fields(record.uuid = %record.uuid))]
    pub async fn propagate_event<T: MediaTransaction>(
        &self,
        tx: &mut T,
        record: RecordRef,
        event_type: EventType,
    ) -> Result<StagedDelivery, AppError> {
        let owner = match record.origin_pod_id {
            Some(owner) if record.ownership == Ownership::Remote => owner,
            _ => {
                tracing::warn!("Events are only sent for records owned by another pod");
                return Ok(StagedDelivery::default());
            }
        };

        let Some(owner) = self.registry.get(owner) else {
            tracing::warn!(pod.id = owner, "Owner of the record is not a friend, event dropped");
            return Ok(StagedDelivery::default());
        };

        let sequence = tx.next_event_sequence(record.uuid).await?;
        let message = self.message(
            record.uuid,
            sequence,
            MessageBody::Event(RecordEvent {
                event_type,
                count: 1,
            }),
        );
        self.fan_out(tx, &message, vec![owner]).await
    }

    /// Queue the removal of an owned record for every peer.
    #[tracing::instrument(skip(self, tx, record), fields(record.uuid = %record.uuid, sequence = record.sequence))]
    pub async fn propagate_remove<T: MediaTransaction>(
        &self,
        tx: &mut T,
        record: RecordRef,
    ) -> Result<StagedDelivery, AppError> {
        if record.ownership != Ownership::Owned {
            tracing::warn!("Refusing to propagate the removal of a record owned by another pod");
            return Ok(StagedDelivery::default());
        }
        let message = self.message(record.uuid, record.sequence, MessageBody::Remove);
        self.fan_out(tx, &message, self.registry.pods()).await
    }

    fn message(&self, record_uuid: uuid::Uuid, sequence: i64, body: MessageBody) -> PropagationMessage {
        PropagationMessage {
            origin: self.config.origin_host.clone(),
            sequence,
            record_uuid,
            body,
        }
    }

    async fn fan_out<T: MediaTransaction>(
        &self,
        tx: &mut T,
        message: &PropagationMessage,
        targets: Vec<Pod>,
    ) -> Result<StagedDelivery, AppError> {
        let mut staged = StagedDelivery::default();
        for pod in targets {
            if tx.enqueue_message(pod.id, message).await? {
                staged.pods.push(pod.id);
                tracing::debug!(
                    pod.id = pod.id,
                    kind = message.body.kind(),
                    "Propagation message staged"
                );
            } else {
                tracing::debug!(pod.id = pod.id, "Peer left before the message was queued");
            }
        }
        Ok(staged)
    }

    fn spawn_sender(&self, handle: &PeerHandle) -> tokio::task::JoinHandle<()> {
        let sender = PeerSender {
            pod: handle.pod.clone(),
            pods: self.pods.clone(),
            outbox: self.outbox.clone(),
            transport: self.transport.clone(),
            config: self.config.clone(),
            wakeup: handle.wakeup.clone(),
        };
        tokio::spawn(sender.run(handle.stop_tx.subscribe(), self.shutdown_tx.subscribe()))
    }
}

/// Drains one peer's queue.
struct PeerSender {
    pod: Pod,
    pods: Arc<dyn PodStore>,
    outbox: Arc<dyn OutboxStore>,
    transport: Arc<dyn PeerTransport>,
    config: FederationConfig,
    wakeup: Arc<Notify>,
}

impl PeerSender {
    async fn run(self, mut stop_rx: watch::Receiver<bool>, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::debug!(pod.id = self.pod.id, pod.host = %self.pod.host, "Peer sender started");

        loop {
            if *stop_rx.borrow() || *shutdown_rx.borrow() {
                break;
            }

            let wait = self.drain(&stop_rx, &shutdown_rx).await;

            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.wakeup.notified() => {}
                _ = sleep(wait) => {}
            }
        }

        tracing::debug!(pod.id = self.pod.id, "Peer sender stopped");
    }

    /// Deliver due entries from the head of the queue. Returns how long to sleep
    /// before looking again.
    async fn drain(&self, stop_rx: &watch::Receiver<bool>, shutdown_rx: &watch::Receiver<bool>) -> Duration {
        loop {
            if *stop_rx.borrow() || *shutdown_rx.borrow() {
                return Duration::ZERO;
            }

            let entry = match self.outbox.head(self.pod.id).await {
                Ok(Some(entry)) => entry,
                Ok(None) => return self.config.poll_interval,
                Err(e) => {
                    tracing::error!(error = %e, pod.id = self.pod.id, "Failed to read outbox");
                    return self.config.poll_interval;
                }
            };

            let now = Utc::now();
            if entry.next_attempt_at > now {
                let due = (entry.next_attempt_at - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                return due.min(self.config.poll_interval);
            }

            self.deliver(entry).await;
        }
    }

    #[tracing::instrument(skip(self, entry), fields(pod.id = self.pod.id, entry.id = entry.id, record.uuid = %entry.record_uuid, sequence = entry.sequence))]
    async fn deliver(&self, entry: OutboxEntry) {
        let body = match serde_json::to_vec(&entry.message) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "Outbox entry cannot be serialized, dropping it");
                self.remove(entry.id).await;
                return;
            }
        };
        let signature = match sign(&body, &self.pod.shared_secret) {
            Ok(signature) => signature,
            Err(e) => {
                tracing::error!(error = %e, "Failed to sign message, dropping it");
                self.remove(entry.id).await;
                return;
            }
        };
        let delivery = SignedDelivery {
            origin: self.config.origin_host.clone(),
            signature,
            body,
        };

        let result = match timeout(
            self.config.delivery_timeout,
            self.transport.deliver(&self.pod, &delivery),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout),
        };

        match result {
            Ok(()) => {
                self.remove(entry.id).await;
                self.adjust_score(POD_SCORE_BONUS).await;
                tracing::debug!("Propagation message delivered");
            }
            Err(err) => {
                self.adjust_score(-POD_SCORE_MALUS).await;
                let attempts = entry.attempts + 1;

                if attempts >= self.config.max_delivery_attempts {
                    tracing::warn!(
                        error = %err,
                        attempts,
                        "Giving up on propagation message"
                    );
                    self.remove(entry.id).await;
                    return;
                }

                let delay = retry_delay(
                    attempts as u32,
                    self.config.retry_base,
                    self.config.retry_max,
                );
                let next_attempt_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

                tracing::info!(
                    error = %err,
                    attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    "Delivery failed, will retry"
                );

                if let Err(e) = self
                    .outbox
                    .record_failure(entry.id, attempts, next_attempt_at, &err.to_string())
                    .await
                {
                    tracing::error!(error = %e, "Failed to record delivery failure");
                }
            }
        }
    }

    async fn remove(&self, entry_id: i64) {
        if let Err(e) = self.outbox.remove(entry_id).await {
            tracing::error!(error = %e, entry.id = entry_id, "Failed to remove outbox entry");
        }
    }

    async fn adjust_score(&self, delta: i32) {
        match self.pods.adjust_score(self.pod.id, delta, POD_SCORE_MAX).await {
            Ok(Some(score)) => tracing::trace!(score, "Pod score adjusted"),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to adjust pod score"),
        }
    }
}
