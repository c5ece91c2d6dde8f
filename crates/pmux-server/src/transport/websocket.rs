//! WebSocket listener using tokio-tungstenite.
//!
//! Each WebSocket connection is wrapped in an adapter that provides
//! multiplexed stream semantics over the single WS connection: every binary
//! message is one [`MuxFrame`]. Streams opened by the server get even ids,
//! streams opened by the client odd ones.

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pmux_core::transport::BoxFuture;
use pmux_core::{
    Connection, FrameKind, MuxFrame, PmuxError, PmuxResult, Stream, StreamId, TransportEvent,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Maximum frame size for WebSocket messages (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Outbound frames queued per connection before senders wait.
const OUTBOUND_QUEUE: usize = 1024;

/// Transport events queued per connection before the reader waits.
const EVENT_QUEUE: usize = 256;

/// Longest a frame may wait for queue space, or for the socket to take it.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> PmuxResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| PmuxError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

/// One stream multiplexed over a WebSocket.
pub struct WsStream {
    id: StreamId,
    label: String,
    open: AtomicBool,
    outbound: mpsc::Sender<Message>,
    events: mpsc::Sender<TransportEvent>,
}

impl WsStream {
    fn mark_closed(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }
}

impl Stream for WsStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn send<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, PmuxResult<()>> {
        Box::pin(async move {
            if !self.is_open() {
                return Err(PmuxError::StreamClosed);
            }
            send_frame(&self.outbound, MuxFrame::data(self.id, data)).await
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.mark_closed() {
                let _ = send_frame(&self.outbound, MuxFrame::close(self.id)).await;
                let _ = self.events.try_send(TransportEvent::StreamClosed(self.id));
            }
        })
    }
}

async fn send_frame(outbound: &mpsc::Sender<Message>, frame: MuxFrame) -> PmuxResult<()> {
    outbound
        .send_timeout(Message::Binary(frame.encode()), WRITE_TIMEOUT)
        .await
        .map_err(|e| match e {
            SendTimeoutError::Timeout(_) => PmuxError::Transport("WebSocket write timed out".into()),
            SendTimeoutError::Closed(_) => PmuxError::Transport("WebSocket connection closed".into()),
        })
}

/// The server side of one WebSocket mux connection.
pub struct WsConnection {
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<Message>,
    events: mpsc::Sender<TransportEvent>,
    streams: Arc<Mutex<HashMap<StreamId, Arc<WsStream>>>>,
    next_id: AtomicU32,
}

impl WsConnection {
    /// Take over an accepted WebSocket. Returns the connection and the event
    /// channel to pump; `Ready` is the first event.
    pub fn serve(conn: WebSocketConnection) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (mut sink, source) = conn.ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);

        let this = Arc::new(Self {
            remote_addr: conn.remote_addr,
            outbound,
            events,
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU32::new(2),
        });

        let remote = conn.remote_addr;
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                match tokio::time::timeout(WRITE_TIMEOUT, sink.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(%remote, "WS send failed: {e}");
                        break;
                    }
                    Err(_) => {
                        warn!(%remote, "WS write timed out, dropping connection");
                        break;
                    }
                }
            }
            let _ = tokio::time::timeout(WRITE_TIMEOUT, sink.close()).await;
        });

        let reader = this.clone();
        tokio::spawn(async move { reader.read_loop(source).await });

        (this, events_rx)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    async fn read_loop(self: Arc<Self>, mut source: SplitStream<WebSocketStream<TcpStream>>) {
        let _ = self.events.send(TransportEvent::Ready).await;
        let reason = loop {
            match recv_binary(&mut source).await {
                Ok(Some(data)) => {
                    if let Err(e) = self.dispatch(&data).await {
                        warn!(remote = %self.remote_addr, "dropping frame: {e}");
                    }
                }
                Ok(None) => break "connection closed by client".to_string(),
                Err(e) => break e.to_string(),
            }
        };
        let streams: Vec<_> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.mark_closed();
        }
        let _ = self.events.send(TransportEvent::Closed { reason }).await;
    }

    async fn dispatch(&self, data: &[u8]) -> PmuxResult<()> {
        let frame = MuxFrame::decode(data)?;
        match frame.kind {
            FrameKind::Open => {
                if frame.stream_id % 2 == 0 {
                    return Err(PmuxError::InvalidMessage(format!(
                        "client opened even stream id {}",
                        frame.stream_id
                    )));
                }
                if self.streams.lock().contains_key(&frame.stream_id) {
                    return Err(PmuxError::InvalidMessage(format!(
                        "stream {} already open",
                        frame.stream_id
                    )));
                }
                let stream = self.register(frame.stream_id, frame.label()?);
                self.emit(TransportEvent::StreamOpened(stream)).await
            }
            FrameKind::Data => {
                if !self.streams.lock().contains_key(&frame.stream_id) {
                    return Err(PmuxError::InvalidMessage(format!(
                        "data on unknown stream {}",
                        frame.stream_id
                    )));
                }
                self.emit(TransportEvent::Message {
                    stream_id: frame.stream_id,
                    data: frame.payload,
                })
                .await
            }
            FrameKind::Close => {
                let Some(stream) = self.streams.lock().remove(&frame.stream_id) else {
                    return Ok(());
                };
                if stream.mark_closed() {
                    self.emit(TransportEvent::StreamClosed(frame.stream_id))
                        .await?;
                }
                Ok(())
            }
        }
    }

    async fn emit(&self, event: TransportEvent) -> PmuxResult<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| PmuxError::Transport("event channel closed".into()))
    }

    fn register(&self, id: StreamId, label: &str) -> Arc<WsStream> {
        let stream = Arc::new(WsStream {
            id,
            label: label.to_string(),
            open: AtomicBool::new(true),
            outbound: self.outbound.clone(),
            events: self.events.clone(),
        });
        self.streams.lock().insert(id, stream.clone());
        stream
    }
}

impl Connection for WsConnection {
    fn open_stream<'a>(&'a self, label: &'a str) -> BoxFuture<'a, PmuxResult<Arc<dyn Stream>>> {
        Box::pin(async move {
            let id = self.next_id.fetch_add(2, Ordering::Relaxed);
            send_frame(&self.outbound, MuxFrame::open(id, label)).await?;
            Ok(self.register(id, label) as Arc<dyn Stream>)
        })
    }

    fn accept_offer<'a>(&'a self, _offer: &'a str) -> BoxFuture<'a, PmuxResult<String>> {
        // The WebSocket handshake already established the connection.
        Box::pin(async { Ok(String::new()) })
    }

    fn add_candidate<'a>(&'a self, _candidate: &'a str) -> BoxFuture<'a, PmuxResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.outbound.send(Message::Close(None)).await;
        })
    }
}

/// Receive the next binary message from a WebSocket.
///
/// Returns `None` if the connection is closed. Text messages are ignored.
/// Rejects frames larger than 1 MiB.
pub async fn recv_binary<S>(ws: &mut S) -> PmuxResult<Option<Vec<u8>>>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                if data.len() > MAX_WS_FRAME_SIZE {
                    return Err(PmuxError::InvalidMessage(format!(
                        "WS frame too large: {} bytes (max {})",
                        data.len(),
                        MAX_WS_FRAME_SIZE
                    )));
                }
                return Ok(Some(data.to_vec()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(_)) => {
                // Pings are answered by tungstenite; text is not part of the protocol.
                continue;
            }
            Some(Err(e)) => {
                return Err(PmuxError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}
