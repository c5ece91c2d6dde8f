//! One connected client.
//!
//! A peer owns the transport connection for its lifetime. It reacts to the
//! streams the client opens (control, new pane, reconnect), serves control
//! requests, and tracks its own replay marker. Everything a peer does to
//! panes goes through the shared registries, so panes outlive the peer.

mod handlers;
pub mod registry;

use crate::session::{Pane, PaneId, PaneSpec};
use crate::state::SharedState;
use parking_lot::Mutex;
use pmux_core::{
    encode_control, Connection, ConnectionHandler, CtrlMessage, PmuxError, PmuxResult, Stream,
    StreamId, StreamLabel,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub type PeerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamRole {
    Control,
    Pane(PaneId),
}

type AckSender = oneshot::Sender<Result<String, String>>;

pub struct Peer {
    pub id: PeerId,
    /// Identity of the connection, used in logs.
    pub fingerprint: String,
    state: Arc<SharedState>,
    conn: Arc<dyn Connection>,
    status: Mutex<PeerState>,
    control: Mutex<Option<Arc<dyn Stream>>>,
    streams: Mutex<HashMap<StreamId, StreamRole>>,
    /// Marker used when this peer reconnects to a pane.
    marker: Mutex<Option<u64>>,
    last_ref: AtomicU64,
    /// Candidates received before the connection was ready, in arrival order.
    pending_candidates: Mutex<Vec<String>>,
    waiting: Mutex<HashMap<u64, AckSender>>,
}

impl Peer {
    /// Create a peer for a fresh connection and register it.
    pub async fn new(
        fingerprint: impl Into<String>,
        state: Arc<SharedState>,
        conn: Arc<dyn Connection>,
    ) -> Arc<Self> {
        let peer = Arc::new(Self {
            id: state.peers.allocate_id(),
            fingerprint: fingerprint.into(),
            state: state.clone(),
            conn,
            status: Mutex::new(PeerState::Connecting),
            control: Mutex::new(None),
            streams: Mutex::new(HashMap::new()),
            marker: Mutex::new(None),
            last_ref: AtomicU64::new(0),
            pending_candidates: Mutex::new(Vec::new()),
            waiting: Mutex::new(HashMap::new()),
        });
        state.peers.register(&peer).await;
        peer
    }

    pub fn status(&self) -> PeerState {
        *self.status.lock()
    }

    pub fn marker(&self) -> Option<u64> {
        *self.marker.lock()
    }

    /// Apply the client's session description and return the answer.
    pub async fn accept_remote_offer(&self, offer: &str) -> PmuxResult<String> {
        if self.status() == PeerState::Closed {
            return Err(PmuxError::Transport("peer is closed".into()));
        }
        self.conn.accept_offer(offer).await
    }

    /// Apply a connection-setup candidate. Candidates arriving before the
    /// connection is ready are queued and applied, in order, once it is.
    pub async fn add_candidate(&self, candidate: &str) -> PmuxResult<()> {
        {
            let status = self.status.lock();
            match *status {
                PeerState::Closed => return Err(PmuxError::Transport("peer is closed".into())),
                PeerState::Connecting => {
                    self.pending_candidates.lock().push(candidate.to_string());
                    debug!(peer_id = self.id, "candidate queued");
                    return Ok(());
                }
                PeerState::Active => {}
            }
        }
        self.conn.add_candidate(candidate).await
    }

    fn next_ref(&self) -> u64 {
        self.last_ref.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn control_stream(&self) -> PmuxResult<Arc<dyn Stream>> {
        self.control.lock().clone().ok_or(PmuxError::StreamClosed)
    }

    async fn send_message(&self, msg: &CtrlMessage) -> PmuxResult<()> {
        let data = encode_control(msg)?;
        self.control_stream()?.send(&data).await
    }

    /// Send a message on the control stream without waiting for a reply.
    pub async fn send_control(&self, msg_type: &str, args: serde_json::Value) -> PmuxResult<u64> {
        let id = self.next_ref();
        self.send_message(&CtrlMessage::new(id, msg_type, args)).await?;
        Ok(id)
    }

    /// Send a message and wait for the client's ack. Returns the ack body;
    /// a nack becomes [`PmuxError::Rejected`].
    pub async fn request(&self, msg_type: &str, args: serde_json::Value) -> PmuxResult<String> {
        let id = self.next_ref();
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(id, tx);

        if let Err(e) = self.send_message(&CtrlMessage::new(id, msg_type, args)).await {
            self.waiting.lock().remove(&id);
            return Err(e);
        }

        let reply = tokio::time::timeout(self.state.peer_settings.ack_timeout, rx).await;
        self.waiting.lock().remove(&id);
        match reply {
            Ok(Ok(Ok(body))) => Ok(body),
            Ok(Ok(Err(desc))) => Err(PmuxError::Rejected(desc)),
            Ok(Err(_)) => Err(PmuxError::StreamClosed),
            Err(_) => Err(PmuxError::AckTimeout(id)),
        }
    }

    /// Acknowledge request `reference`.
    pub async fn ack(&self, reference: u64, body: &str) -> PmuxResult<()> {
        let mut args = serde_json::json!({ "ref": reference });
        if !body.is_empty() {
            args["body"] = body.into();
        }
        self.send_control("ack", args).await.map(|_| ())
    }

    /// Reject request `reference`.
    pub async fn nack(&self, reference: u64, desc: &str) -> PmuxResult<()> {
        self.send_control("nack", serde_json::json!({ "ref": reference, "desc": desc }))
            .await
            .map(|_| ())
    }

    /// Send a control message to every other peer. Each copy is a request of
    /// its own; acks are awaited in the background so a slow peer does not
    /// hold up the sender.
    async fn broadcast(&self, msg_type: &str, args: serde_json::Value) {
        for peer in self.state.peers.others(self.id).await {
            let (msg_type, args) = (msg_type.to_string(), args.clone());
            tokio::spawn(async move {
                if let Err(e) = peer.request(&msg_type, args).await {
                    debug!(peer_id = peer.id, msg_type, "broadcast not acknowledged: {e}");
                }
            });
        }
    }

    /// Send the preamble on a new pane's stream and subscribe it.
    async fn attach(&self, stream: &Arc<dyn Stream>, pane: &Pane) -> PmuxResult<()> {
        stream.send(pane.preamble().as_bytes()).await?;
        self.state
            .subscriptions
            .add(stream.clone(), pane.id, self.id, false)
            .await;
        self.streams.lock().insert(stream.id(), StreamRole::Pane(pane.id));
        Ok(())
    }

    /// Start a pane whose output goes to `stream`. On failure the pane is
    /// killed and removed again.
    async fn start_pane(&self, spec: PaneSpec, stream: &Arc<dyn Stream>) -> PmuxResult<Arc<Pane>> {
        let pane = self.state.spawn_pane(spec).await?;
        if let Err(e) = self.attach(stream, &pane).await {
            self.discard_pane(&pane).await;
            return Err(e);
        }
        pane.run();
        Ok(pane)
    }

    async fn discard_pane(&self, pane: &Pane) {
        pane.kill().await;
        let _ = self.state.panes.delete(pane.id).await;
    }

    /// Attach `stream` to a running pane and queue a replay from this
    /// peer's marker. Live output reaches the stream only after the replay.
    async fn reattach(&self, stream: &Arc<dyn Stream>, pane_id: PaneId) -> PmuxResult<Arc<Pane>> {
        let pane = self
            .state
            .panes
            .get(pane_id)
            .await
            .ok_or(PmuxError::PaneNotFound(pane_id))?;
        if !pane.is_running() {
            return Err(PmuxError::PaneNotRunning(pane_id));
        }

        stream.send(pane.id.to_string().as_bytes()).await?;
        let sub = self
            .state
            .subscriptions
            .add(stream.clone(), pane.id, self.id, true)
            .await;
        self.streams.lock().insert(stream.id(), StreamRole::Pane(pane.id));

        let marker = self.marker();
        if let Err(e) = pane.restore(sub.id, marker).await {
            let _ = self.state.subscriptions.remove(sub.id).await;
            self.streams.lock().remove(&stream.id());
            return Err(e);
        }
        info!(peer_id = self.id, pane_id, marker = ?marker, "reconnected to pane");
        Ok(pane)
    }

    async fn open_labelled(&self, stream: Arc<dyn Stream>, label: StreamLabel) -> PmuxResult<()> {
        match label {
            StreamLabel::Control => {
                let old = self.control.lock().replace(stream.clone());
                if let Some(old) = old {
                    debug!(peer_id = self.id, old = old.id(), "control stream replaced");
                }
                self.streams.lock().insert(stream.id(), StreamRole::Control);
                info!(peer_id = self.id, stream_id = stream.id(), "control stream open");
            }
            StreamLabel::NewPane {
                dimensions,
                command,
            } => {
                let spec = PaneSpec {
                    command,
                    dimensions,
                    parent: None,
                };
                self.start_pane(spec, &stream).await?;
            }
            StreamLabel::Reconnect { pane_id } => {
                self.reattach(&stream, pane_id).await?;
            }
        }
        Ok(())
    }
}

impl ConnectionHandler for Peer {
    async fn on_ready(&self) {
        // Drain in batches; the switch to Active happens under the status
        // lock only once the queue is empty, so no candidate overtakes one
        // that was queued earlier.
        loop {
            let batch = {
                let mut status = self.status.lock();
                let mut pending = self.pending_candidates.lock();
                if *status == PeerState::Closed {
                    return;
                }
                if pending.is_empty() {
                    *status = PeerState::Active;
                    break;
                }
                std::mem::take(&mut *pending)
            };
            for candidate in batch {
                if let Err(e) = self.conn.add_candidate(&candidate).await {
                    warn!(peer_id = self.id, "queued candidate rejected: {e}");
                }
            }
        }
        info!(peer_id = self.id, fingerprint = %self.fingerprint, "peer ready");
    }

    async fn on_stream_open(&self, stream: Arc<dyn Stream>) {
        let result = match stream.label().parse::<StreamLabel>() {
            Ok(label) => self.open_labelled(stream.clone(), label).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(
                peer_id = self.id,
                stream_id = stream.id(),
                label = stream.label(),
                "closing stream: {e}"
            );
            stream.close().await;
        }
    }

    async fn on_message(&self, stream_id: StreamId, data: Vec<u8>) {
        let role = self.streams.lock().get(&stream_id).copied();
        match role {
            Some(StreamRole::Control) => self.handle_control(&data).await,
            Some(StreamRole::Pane(pane_id)) => match self.state.panes.get(pane_id).await {
                Some(pane) => pane.write(data).await,
                None => debug!(peer_id = self.id, pane_id, "input for deleted pane"),
            },
            None => debug!(peer_id = self.id, stream_id, "message on unknown stream"),
        }
    }

    async fn on_stream_close(&self, stream_id: StreamId) {
        let role = self.streams.lock().remove(&stream_id);
        match role {
            Some(StreamRole::Control) => {
                let mut control = self.control.lock();
                if control.as_ref().map(|s| s.id()) == Some(stream_id) {
                    *control = None;
                }
            }
            Some(StreamRole::Pane(pane_id)) => {
                if let Some(sub) = self
                    .state
                    .subscriptions
                    .remove_stream(self.id, stream_id)
                    .await
                {
                    debug!(peer_id = self.id, pane_id, subscription_id = sub.id, "stream detached");
                }
            }
            None => {}
        }
    }

    async fn on_closed(&self, reason: &str) {
        *self.status.lock() = PeerState::Closed;
        self.pending_candidates.lock().clear();
        self.streams.lock().clear();
        self.control.lock().take();
        // Dropping the senders fails every outstanding `request`.
        self.waiting.lock().clear();

        let detached = self.state.subscriptions.remove_peer(self.id).await;
        self.state.peers.unregister(self.id).await;
        info!(
            peer_id = self.id,
            reason,
            subscriptions = detached.len(),
            "peer closed"
        );
    }
}
