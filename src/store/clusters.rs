//! Peer clusters
//!
//! Stores of the other clusters that contribute delegating records. How a
//! peer connects is not decided here; whoever owns the connection flips
//! `connected` as the link comes and goes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::info;

use super::RecordStore;

pub struct PeerCluster {
    pub id: String,
    pub store: Arc<dyn RecordStore>,
    connected: AtomicBool,
}

impl PeerCluster {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// This cluster's id plus every known peer
pub struct ClusterRegistry {
    local_id: String,
    peers: RwLock<BTreeMap<String, Arc<PeerCluster>>>,
}

impl ClusterRegistry {
    pub fn new(local_id: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            peers: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn add_peer(&self, id: &str, store: Arc<dyn RecordStore>) {
        let peer = Arc::new(PeerCluster {
            id: id.to_string(),
            store,
            connected: AtomicBool::new(true),
        });
        self.write().insert(id.to_string(), peer);
        info!(cluster = %id, "Registered peer cluster");
    }

    pub fn remove_peer(&self, id: &str) -> bool {
        self.write().remove(id).is_some()
    }

    pub fn set_connected(&self, id: &str, connected: bool) {
        if let Some(peer) = self.read().get(id) {
            if peer.connected.swap(connected, Ordering::SeqCst) != connected {
                info!(cluster = %id, connected, "Peer cluster connectivity changed");
            }
        }
    }

    pub fn peers(&self) -> Vec<Arc<PeerCluster>> {
        self.read().values().cloned().collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<PeerCluster>>> {
        self.peers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<PeerCluster>>> {
        self.peers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRecordStore;

    #[test]
    fn test_peer_connectivity() {
        let clusters = ClusterRegistry::new("home");
        clusters.add_peer("peer-1", Arc::new(InMemoryRecordStore::new()));

        assert_eq!(clusters.local_id(), "home");
        assert!(clusters.peers()[0].is_connected());

        clusters.set_connected("peer-1", false);
        assert!(!clusters.peers()[0].is_connected());

        assert!(clusters.remove_peer("peer-1"));
        assert!(clusters.peers().is_empty());
    }
}
