//! Friend pod registry
//!
//! In-memory view of the peers this pod replicates to, with the handles of their
//! sender tasks. Owned by the broker; the `pods` table stays the durable source.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use peerpod_core::models::Pod;

pub(crate) struct PeerHandle {
    pub(crate) pod: Pod,
    pub(crate) wakeup: Arc<Notify>,
    pub(crate) stop_tx: watch::Sender<bool>,
    pub(crate) task: Option<JoinHandle<()>>,
}

impl PeerHandle {
    pub(crate) fn new(pod: Pod) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            pod,
            wakeup: Arc::new(Notify::new()),
            stop_tx,
            task: None,
        }
    }
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<i64, PeerHandle>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pods(&self) -> Vec<Pod> {
        let mut pods: Vec<Pod> = self.read().values().map(|h| h.pod.clone()).collect();
        pods.sort_by_key(|p| p.id);
        pods
    }

    pub fn get(&self, pod_id: i64) -> Option<Pod> {
        self.read().get(&pod_id).map(|h| h.pod.clone())
    }

    pub fn contains(&self, pod_id: i64) -> bool {
        self.read().contains_key(&pod_id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Nudge the peer's sender to look at its queue.
    pub fn wake(&self, pod_id: i64) {
        if let Some(handle) = self.read().get(&pod_id) {
            handle.wakeup.notify_one();
        }
    }

    /// Insert unless already present. Returns false for a duplicate.
    pub(crate) fn insert(&self, handle: PeerHandle) -> bool {
        let mut peers = self.write();
        if peers.contains_key(&handle.pod.id) {
            return false;
        }
        peers.insert(handle.pod.id, handle);
        true
    }

    pub(crate) fn remove(&self, pod_id: i64) -> Option<PeerHandle> {
        self.write().remove(&pod_id)
    }

    /// Take every handle out, for shutdown.
    pub(crate) fn drain(&self) -> Vec<PeerHandle> {
        self.write().drain().map(|(_, h)| h).collect()
    }

    pub(crate) fn with_handles<R>(&self, f: impl FnOnce(&mut HashMap<i64, PeerHandle>) -> R) -> R {
        f(&mut self.write())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<i64, PeerHandle>> {
        match self.peers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<i64, PeerHandle>> {
        match self.peers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pod(id: i64, host: &str) -> Pod {
        Pod {
            id,
            host: host.to_string(),
            shared_secret: "secret".to_string(),
            score: 100,
            last_seen_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn duplicates_are_refused() {
        let registry = PeerRegistry::new();
        assert!(registry.insert(PeerHandle::new(pod(1, "a"))));
        assert!(!registry.insert(PeerHandle::new(pod(1, "a"))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn pods_are_listed_by_id() {
        let registry = PeerRegistry::new();
        registry.insert(PeerHandle::new(pod(3, "c")));
        registry.insert(PeerHandle::new(pod(1, "a")));
        let ids: Vec<i64> = registry.pods().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 3]);

        assert!(registry.remove(1).is_some());
        assert!(!registry.contains(1));
        assert_eq!(registry.get(3).map(|p| p.host), Some("c".to_string()));
    }
}
