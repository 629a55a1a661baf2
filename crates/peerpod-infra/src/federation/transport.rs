//! Peer transport
//!
//! The broker hands signed bodies to a [`PeerTransport`]. [`HttpTransport`] POSTs
//! them to the peer's inbox; tests swap in a recording transport.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;

use peerpod_core::constants::{ORIGIN_HEADER, SIGNATURE_HEADER};
use peerpod_core::models::Pod;

/// A message body ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedDelivery {
    /// Host of the sending pod, as the receiver knows it.
    pub origin: String,
    /// `v1=<hex>` HMAC of `body`.
    pub signature: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Delivery timed out")]
    Timeout,

    #[error("Peer rejected delivery with status {status}")]
    Rejected { status: u16 },
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn deliver(&self, pod: &Pod, delivery: &SignedDelivery) -> Result<(), DeliveryError>;
}

/// Delivers over HTTP to `{host}/api/v1/federation/inbox`.
#[derive(Clone)]
pub struct HttpTransport {
    http_client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client for federation: {}", e))?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    #[tracing::instrument(skip(self, pod, delivery), fields(pod.id = pod.id, pod.host = %pod.host))]
    async fn deliver(&self, pod: &Pod, delivery: &SignedDelivery) -> Result<(), DeliveryError> {
        let response = self
            .http_client
            .post(pod.inbox_url())
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, &delivery.signature)
            .header(ORIGIN_HEADER, &delivery.origin)
            .body(delivery.body.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout
                } else {
                    DeliveryError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
