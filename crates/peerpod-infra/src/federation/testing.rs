//! Recording transport for tests
//!
//! Captures every delivery instead of sending it. Hosts can be marked unreachable
//! (fail fast) or hanging (never answer, so the broker's timeout fires).

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use peerpod_core::models::{Pod, PropagationMessage};

use super::transport::{DeliveryError, PeerTransport, SignedDelivery};

#[derive(Default)]
pub struct RecordingTransport {
    delivered: Mutex<Vec<(String, SignedDelivery)>>,
    attempts: Mutex<HashMap<String, usize>>,
    unreachable: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut hosts = self.unreachable.lock().unwrap();
        if unreachable {
            hosts.insert(host.to_string());
        } else {
            hosts.remove(host);
        }
    }

    pub fn set_hanging(&self, host: &str, hanging: bool) {
        let mut hosts = self.hanging.lock().unwrap();
        if hanging {
            hosts.insert(host.to_string());
        } else {
            hosts.remove(host);
        }
    }

    /// Successful deliveries as `(host, delivery)`, in delivery order.
    pub fn deliveries(&self) -> Vec<(String, SignedDelivery)> {
        self.delivered.lock().unwrap().clone()
    }

    /// Messages successfully delivered to `host`, decoded.
    pub fn messages_to(&self, host: &str) -> Vec<PropagationMessage> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == host)
            .filter_map(|(_, d)| serde_json::from_slice(&d.body).ok())
            .collect()
    }

    /// Delivery attempts made to `host`, failed ones included.
    pub fn attempts_to(&self, host: &str) -> usize {
        self.attempts.lock().unwrap().get(host).copied().unwrap_or(0)
    }
}

#[async_trait]
impl PeerTransport for RecordingTransport {
    async fn deliver(&self, pod: &Pod, delivery: &SignedDelivery) -> Result<(), DeliveryError> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(pod.host.clone())
            .or_insert(0) += 1;

        let hanging = self.hanging.lock().unwrap().contains(&pod.host);
        if hanging {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        if self.unreachable.lock().unwrap().contains(&pod.host) {
            return Err(DeliveryError::Unreachable(format!(
                "connection refused by {}",
                pod.host
            )));
        }

        self.delivered
            .lock()
            .unwrap()
            .push((pod.host.clone(), delivery.clone()));
        Ok(())
    }
}
