//! The pmux server: accepts WebSocket connections and runs one peer per
//! connection against the shared pane state.

use crate::config::ServerConfig;
use crate::peer::Peer;
use crate::state::SharedState;
use crate::transport::{websocket, WebSocketConnection, WsConnection};
use pmux_core::{pump, PmuxResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

pub struct PmuxServer {
    config: ServerConfig,
    state: Arc<SharedState>,
}

impl PmuxServer {
    pub fn new(config: ServerConfig) -> Self {
        let state = SharedState::new(config.panes.clone(), config.peers.clone());
        Self { config, state }
    }

    #[cfg(test)]
    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    /// Bind the listener. Returns the bound address and the accepted
    /// connections to hand to [`PmuxServer::serve`].
    pub async fn bind(&self) -> PmuxResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
        websocket::start_listener(self.config.bind_addr()).await
    }

    /// Bind and serve until the listener stops.
    pub async fn run(self: Arc<Self>) -> PmuxResult<()> {
        let (addr, incoming) = self.bind().await?;
        info!(
            %addr,
            buffer_size = self.config.panes.buffer_size,
            "pmux-server ready"
        );
        self.serve(incoming).await;
        Ok(())
    }

    pub async fn serve(self: Arc<Self>, mut incoming: mpsc::Receiver<WebSocketConnection>) {
        while let Some(conn) = incoming.recv().await {
            let srv = self.clone();
            tokio::spawn(async move { srv.handle_connection(conn).await });
        }
        info!("listener closed, shutting down");
    }

    async fn handle_connection(&self, conn: WebSocketConnection) {
        let (ws, events) = WsConnection::serve(conn);
        let remote = ws.remote_addr();
        let peer = Peer::new(remote.to_string(), self.state.clone(), ws).await;
        info!(peer_id = peer.id, %remote, "peer connected");
        pump(events, &*peer).await;
    }

    /// Kill every pane. Connected peers see their pane streams close.
    pub async fn shutdown(&self) {
        let panes = self.state.panes.all().await;
        let peers = self.state.peers.count().await;
        info!(panes = panes.len(), peers, "stopping panes");
        for pane in panes {
            pane.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PaneSettings, PeerSettings};
    use futures_util::{SinkExt, StreamExt};
    use pmux_core::{decode_control, encode_control, CtrlMessage, FrameKind, MuxFrame};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    fn config() -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1".parse().unwrap(),
            port: 0,
            panes: PaneSettings::default(),
            peers: PeerSettings::default(),
        }
    }

    async fn start() -> (Arc<PmuxServer>, SocketAddr) {
        let server = Arc::new(PmuxServer::new(config()));
        let (addr, incoming) = server.bind().await.unwrap();
        tokio::spawn(server.clone().serve(incoming));
        (server, addr)
    }

    #[tokio::test]
    async fn add_pane_over_websocket() {
        let (server, addr) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();

        ws.send(Message::Binary(MuxFrame::open(1, "%").encode().into()))
            .await
            .unwrap();
        let req = CtrlMessage::new(7, "add_pane", serde_json::json!({ "command": ["echo", "wired"] }));
        ws.send(Message::Binary(
            MuxFrame::data(1, &encode_control(&req).unwrap()).encode().into(),
        ))
        .await
        .unwrap();

        let mut pane_stream = None;
        let mut output = Vec::new();
        let mut acked = false;
        let mut closed = false;
        while !(acked && closed) {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out")
                .unwrap()
                .unwrap();
            let Message::Binary(data) = msg else { continue };
            let frame = MuxFrame::decode(&data).unwrap();
            match frame.kind {
                FrameKind::Open => {
                    assert_eq!(frame.stream_id % 2, 0);
                    assert_eq!(frame.label().unwrap(), "7:1");
                    pane_stream = Some(frame.stream_id);
                }
                FrameKind::Data if frame.stream_id == 1 => {
                    let reply = decode_control(&frame.payload).unwrap();
                    assert_eq!(reply.msg_type, "ack");
                    assert_eq!(reply.args["ref"], 7);
                    assert_eq!(reply.args["body"], "1");
                    acked = true;
                }
                FrameKind::Data => {
                    assert_eq!(Some(frame.stream_id), pane_stream);
                    output.extend_from_slice(&frame.payload);
                }
                FrameKind::Close => {
                    assert_eq!(Some(frame.stream_id), pane_stream);
                    closed = true;
                }
            }
        }

        let output = String::from_utf8_lossy(&output);
        assert!(output.starts_with("1,24x80"), "{output:?}");
        assert!(output.contains("wired"), "{output:?}");
        assert_eq!(server.state().panes.count().await, 1);
    }

    #[tokio::test]
    async fn disconnect_unregisters_peer() {
        let (server, addr) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        ws.send(Message::Binary(MuxFrame::open(1, "%").encode().into()))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while server.state().peers.count().await != 1 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let _ = ws.close(None).await;
        drop(ws);
        while server.state().peers.count().await != 0 {
            assert!(tokio::time::Instant::now() < deadline, "peer never unregistered");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn shutdown_kills_panes() {
        let server = PmuxServer::new(config());
        let pane = server
            .state()
            .spawn_pane(crate::session::PaneSpec {
                command: vec!["sleep".into(), "30".into()],
                dimensions: None,
                parent: None,
            })
            .await
            .unwrap();
        server.shutdown().await;
        assert!(!pane.is_running());
    }
}
