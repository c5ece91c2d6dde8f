//! Which streams receive which pane's output.
//!
//! A subscription ties one stream of one peer to one pane. Panes fetch
//! their subscribers from here on every chunk they send, so attaching or
//! detaching takes effect on the very next chunk.

use pmux_core::{PmuxError, PmuxResult, Stream, StreamId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::pane::PaneId;
use crate::peer::PeerId;

pub type SubscriptionId = u64;

pub struct Subscription {
    pub id: SubscriptionId,
    pub pane_id: PaneId,
    pub peer_id: PeerId,
    pub stream: Arc<dyn Stream>,
    /// Set while a replay for this stream is queued; live output skips it.
    awaiting_restore: AtomicBool,
}

impl Subscription {
    pub fn awaiting_restore(&self) -> bool {
        self.awaiting_restore.load(Ordering::Acquire)
    }

    pub fn restored(&self) {
        self.awaiting_restore.store(false, Ordering::Release);
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream.id()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pane_id", &self.pane_id)
            .field("peer_id", &self.peer_id)
            .field("stream_id", &self.stream.id())
            .field("awaiting_restore", &self.awaiting_restore())
            .finish()
    }
}

#[derive(Default)]
struct Inner {
    next_id: SubscriptionId,
    subs: HashMap<SubscriptionId, Arc<Subscription>>,
}

/// Registry of live subscriptions, shared by every peer and pane.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(
        &self,
        stream: Arc<dyn Stream>,
        pane_id: PaneId,
        peer_id: PeerId,
        awaiting_restore: bool,
    ) -> Arc<Subscription> {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let sub = Arc::new(Subscription {
            id: inner.next_id,
            pane_id,
            peer_id,
            stream,
            awaiting_restore: AtomicBool::new(awaiting_restore),
        });
        inner.subs.insert(sub.id, sub.clone());
        debug!(
            subscription_id = sub.id,
            pane_id,
            peer_id,
            stream_id = sub.stream_id(),
            "subscribed"
        );
        sub
    }

    pub async fn get(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.inner.read().await.subs.get(&id).cloned()
    }

    /// Subscribers of a pane, in subscription order.
    pub async fn for_pane(&self, pane_id: PaneId) -> Vec<Arc<Subscription>> {
        self.collect(|s| s.pane_id == pane_id).await
    }

    pub async fn for_peer(&self, peer_id: PeerId) -> Vec<Arc<Subscription>> {
        self.collect(|s| s.peer_id == peer_id).await
    }

    async fn collect(&self, keep: impl Fn(&Subscription) -> bool) -> Vec<Arc<Subscription>> {
        let inner = self.inner.read().await;
        let mut subs: Vec<_> = inner.subs.values().filter(|s| keep(s)).cloned().collect();
        subs.sort_by_key(|s| s.id);
        subs
    }

    pub async fn remove(&self, id: SubscriptionId) -> PmuxResult<Arc<Subscription>> {
        let mut inner = self.inner.write().await;
        let sub = inner
            .subs
            .remove(&id)
            .ok_or(PmuxError::SubscriptionNotFound(id))?;
        debug!(subscription_id = id, pane_id = sub.pane_id, "unsubscribed");
        Ok(sub)
    }

    /// Drop the subscription carried by one stream of a peer, if any.
    pub async fn remove_stream(
        &self,
        peer_id: PeerId,
        stream_id: StreamId,
    ) -> Option<Arc<Subscription>> {
        let mut inner = self.inner.write().await;
        let id = inner
            .subs
            .values()
            .find(|s| s.peer_id == peer_id && s.stream_id() == stream_id)
            .map(|s| s.id)?;
        inner.subs.remove(&id)
    }

    /// Drop every subscription of a peer.
    pub async fn remove_peer(&self, peer_id: PeerId) -> Vec<Arc<Subscription>> {
        let mut inner = self.inner.write().await;
        let ids: Vec<_> = inner
            .subs
            .values()
            .filter(|s| s.peer_id == peer_id)
            .map(|s| s.id)
            .collect();
        ids.iter().filter_map(|id| inner.subs.remove(id)).collect()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.subs.len()
    }
}
