//! Registry of connected peers.
//!
//! Lets one peer reach the others, e.g. to broadcast a resize or a new
//! payload. Entries hold weak references so a closed peer is never kept
//! alive by the registry.

use super::{Peer, PeerId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A registered peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    /// Identity of the peer's connection.
    pub fingerprint: String,
    /// When the peer registered.
    pub registered_at: Instant,
    peer: Weak<Peer>,
}

impl PeerEntry {
    pub fn peer(&self) -> Option<Arc<Peer>> {
        self.peer.upgrade()
    }
}

/// Registry of live peers.
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    /// Monotonic peer id counter.
    next_id: AtomicU64,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a peer about to be created.
    pub fn allocate_id(&self) -> PeerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register(&self, peer: &Arc<Peer>) {
        let entry = PeerEntry {
            peer_id: peer.id,
            fingerprint: peer.fingerprint.clone(),
            registered_at: Instant::now(),
            peer: Arc::downgrade(peer),
        };
        self.peers.write().await.insert(peer.id, entry);
        info!(peer_id = peer.id, fingerprint = %peer.fingerprint, "peer registered");
    }

    pub async fn unregister(&self, peer_id: PeerId) {
        if let Some(entry) = self.peers.write().await.remove(&peer_id) {
            debug!(
                peer_id,
                fingerprint = %entry.fingerprint,
                connected_for = ?entry.registered_at.elapsed(),
                "peer unregistered"
            );
        }
    }

    /// List all registered peers.
    pub async fn list(&self) -> Vec<PeerEntry> {
        let mut entries: Vec<_> = self.peers.read().await.values().cloned().collect();
        entries.sort_by_key(|e| e.peer_id);
        entries
    }

    /// Every live peer except `peer_id`.
    pub async fn others(&self, peer_id: PeerId) -> Vec<Arc<Peer>> {
        self.list()
            .await
            .into_iter()
            .filter(|e| e.peer_id != peer_id)
            .filter_map(|e| e.peer())
            .collect()
    }

    /// Number of registered peers.
    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }
}
