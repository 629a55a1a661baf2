//! Inbound federation messages
//!
//! [`InboundProcessor::accept`] authenticates a delivery (known origin host, valid
//! signature from that host's shared secret), parses and validates the message, and
//! hands it to an [`InboundApplier`] that applies it to local state.

use async_trait::async_trait;
use std::sync::Arc;
use validator::Validate;

use peerpod_core::models::{MessageBody, Pod, PropagationMessage};
use peerpod_core::AppError;
use peerpod_db::PodStore;

use super::signature::verify;

/// A message whose origin has been authenticated.
#[derive(Debug, Clone)]
pub struct VerifiedMessage {
    pub pod: Pod,
    pub message: PropagationMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Applied,
    /// Stale or duplicate: the sequence was not greater than the last accepted one.
    Discarded,
}

#[async_trait]
pub trait InboundApplier: Send + Sync {
    async fn apply_inbound(&self, message: VerifiedMessage) -> Result<InboundOutcome, AppError>;
}

pub struct InboundProcessor {
    pods: Arc<dyn PodStore>,
    applier: Arc<dyn InboundApplier>,
}

impl InboundProcessor {
    pub fn new(pods: Arc<dyn PodStore>, applier: Arc<dyn InboundApplier>) -> Self {
        Self { pods, applier }
    }

    #[tracing::instrument(skip(self, signature, body), fields(origin = %origin_host))]
    pub async fn accept(
        &self,
        origin_host: &str,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<InboundOutcome, AppError> {
        let verified = self.verify(origin_host, signature, body).await?;
        let record_uuid = verified.message.record_uuid;
        let sequence = verified.message.sequence;
        let kind = verified.message.body.kind();

        let outcome = self.applier.apply_inbound(verified).await?;
        match outcome {
            InboundOutcome::Applied => {
                tracing::debug!(record.uuid = %record_uuid, sequence, kind, "Inbound message applied")
            }
            InboundOutcome::Discarded => {
                tracing::info!(record.uuid = %record_uuid, sequence, kind, "Stale inbound message discarded")
            }
        }
        Ok(outcome)
    }

    /// Authenticate and parse without applying.
    pub async fn verify(
        &self,
        origin_host: &str,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<VerifiedMessage, AppError> {
        let pod = self
            .pods
            .find_by_host(origin_host)
            .await?
            .ok_or_else(|| AppError::Unauthorized(format!("{} is not a friend pod", origin_host)))?;

        let signature = signature
            .ok_or_else(|| AppError::Unauthorized("Missing message signature".to_string()))?;
        verify(body, &pod.shared_secret, signature)?;

        let message: PropagationMessage = serde_json::from_slice(body)?;
        if message.origin != pod.host {
            return Err(AppError::Unauthorized(format!(
                "Message claims origin {} but was signed by {}",
                message.origin, pod.host
            )));
        }
        check_message(&message)?;

        if let Err(e) = self.pods.touch_last_seen(pod.id).await {
            tracing::warn!(error = %e, pod.id = pod.id, "Failed to update pod last_seen_at");
        }

        Ok(VerifiedMessage { pod, message })
    }
}

fn check_message(message: &PropagationMessage) -> Result<(), AppError> {
    if message.sequence < 1 {
        return Err(AppError::Validation(format!(
            "Invalid sequence {}",
            message.sequence
        )));
    }
    match &message.body {
        MessageBody::FullRecord(record) => {
            record.validate()?;
            if record.uuid != message.record_uuid {
                return Err(AppError::Validation(
                    "Record uuid does not match the message".to_string(),
                ));
            }
        }
        MessageBody::QuickUpdate(update) => {
            if update.is_empty() {
                return Err(AppError::Validation("Empty quick update".to_string()));
            }
            if update.views.is_some_and(|v| v < 0) {
                return Err(AppError::Validation("Negative view count".to_string()));
            }
        }
        MessageBody::Event(event) => {
            if event.count < 1 {
                return Err(AppError::Validation(format!(
                    "Invalid event count {}",
                    event.count
                )));
            }
        }
        MessageBody::Remove => {}
    }
    Ok(())
}
