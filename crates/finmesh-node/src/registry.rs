//! Live peer registry.
//!
//! One entry per connected peer, keyed by peer id. The stored value is the
//! connection's write handle: a cloneable sender feeding that connection's
//! single writer task, which keeps concurrent writes to one connection from
//! interleaving. All mutation happens through this type; the lock serializes
//! receive loops racing to add or remove entries.

use std::collections::HashMap;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use finmesh_protocol::Envelope;

/// Write handle for one peer connection.
pub(crate) type PeerSender = mpsc::Sender<Envelope>;

/// A node's live view of who it is connected to.
///
/// Peer ids are unique within one registry at any instant but carry no
/// mesh-wide uniqueness: a second registration under the same id overwrites
/// the first without draining it.
#[derive(Default)]
pub(crate) struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerSender>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer, returning true when an existing entry was replaced.
    pub async fn register(&self, peer_id: &str, sender: PeerSender) -> bool {
        let replaced = self
            .peers
            .write()
            .await
            .insert(peer_id.to_string(), sender)
            .is_some();
        if replaced {
            debug!(peer_id = %peer_id, "replaced existing registry entry");
        }
        replaced
    }

    /// Returns the write handle for a peer, if registered.
    pub async fn get(&self, peer_id: &str) -> Option<PeerSender> {
        self.peers.read().await.get(peer_id).cloned()
    }

    /// Removes the entry only if it still refers to the given connection.
    ///
    /// A closing connection must not evict an entry that a newer connection
    /// has since overwritten under the same id.
    pub async fn remove_if_same(&self, peer_id: &str, sender: &PeerSender) -> bool {
        let mut peers = self.peers.write().await;
        if let Some(current) = peers.get(peer_id)
            && current.same_channel(sender)
        {
            peers.remove(peer_id);
            return true;
        }
        false
    }

    /// Snapshot of all entries for a broadcast sweep.
    pub async fn snapshot(&self) -> Vec<(String, PeerSender)> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(id, sender)| (id.clone(), sender.clone()))
            .collect()
    }

    /// Registered peer ids as of this call.
    pub async fn peer_ids(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (PeerSender, mpsc::Receiver<Envelope>) {
        mpsc::channel(4)
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = PeerRegistry::new();
        let (tx, _rx) = channel();

        assert!(!registry.register("peer_1", tx.clone()).await);
        assert_eq!(registry.peer_ids().await, vec!["peer_1".to_string()]);
        assert!(registry.get("peer_1").await.is_some());
        assert!(registry.get("peer_2").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_id_overwrites() {
        let registry = PeerRegistry::new();
        let (old_tx, _old_rx) = channel();
        let (new_tx, _new_rx) = channel();

        assert!(!registry.register("peer_1", old_tx).await);
        assert!(registry.register("peer_1", new_tx.clone()).await);
        assert_eq!(registry.peer_ids().await.len(), 1);

        let current = registry.get("peer_1").await.unwrap();
        assert!(current.same_channel(&new_tx));
    }

    #[tokio::test]
    async fn remove_if_same_skips_overwritten_entry() {
        let registry = PeerRegistry::new();
        let (old_tx, _old_rx) = channel();
        let (new_tx, _new_rx) = channel();

        registry.register("peer_1", old_tx.clone()).await;
        registry.register("peer_1", new_tx).await;

        // Cleanup from the stale connection must leave the newer entry alone.
        assert!(!registry.remove_if_same("peer_1", &old_tx).await);
        assert_eq!(registry.peer_ids().await.len(), 1);
    }

    #[tokio::test]
    async fn remove_if_same_removes_current_entry() {
        let registry = PeerRegistry::new();
        let (tx, _rx) = channel();

        registry.register("peer_1", tx.clone()).await;
        assert!(registry.remove_if_same("peer_1", &tx).await);
        assert!(registry.peer_ids().await.is_empty());
    }

    #[tokio::test]
    async fn snapshot_reflects_call_time() {
        let registry = PeerRegistry::new();
        let (tx, _rx) = channel();

        registry.register("peer_1", tx.clone()).await;
        registry.register("peer_2", tx.clone()).await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);

        registry.remove_if_same("peer_1", &tx).await;
        // The old snapshot is unaffected by later mutation.
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.peer_ids().await, vec!["peer_2".to_string()]);
    }
}
