//! In-memory transport for driving peers and panes in tests.
//!
//! [`MemoryConnection`] is the server side and implements the transport
//! traits. [`RemoteEnd`] plays the client: it injects events into the
//! connection's event channel and observes what the server sends.

use parking_lot::Mutex;
use pmux_core::transport::BoxFuture;
use pmux_core::{
    decode_control, encode_control, Connection, CtrlMessage, PmuxError, PmuxResult, Stream,
    StreamId, TransportEvent,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const EVENT_QUEUE: usize = 256;
const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// What the client observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    Opened { stream_id: StreamId, label: String },
    Data { stream_id: StreamId, data: Vec<u8> },
    Closed(StreamId),
}

pub struct MemoryStream {
    id: StreamId,
    label: String,
    open: AtomicBool,
    to_remote: mpsc::UnboundedSender<RemoteEvent>,
    events: mpsc::Sender<TransportEvent>,
}

impl Stream for MemoryStream {
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
            self.to_remote
                .send(RemoteEvent::Data {
                    stream_id: self.id,
                    data: data.to_vec(),
                })
                .map_err(|_| PmuxError::Transport("remote end dropped".into()))
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.open.swap(false, Ordering::AcqRel) {
                let _ = self.to_remote.send(RemoteEvent::Closed(self.id));
                let _ = self.events.try_send(TransportEvent::StreamClosed(self.id));
            }
        })
    }
}

#[derive(Default)]
struct Shared {
    streams: Mutex<HashMap<StreamId, Arc<MemoryStream>>>,
}

pub struct MemoryConnection {
    shared: Arc<Shared>,
    to_remote: mpsc::UnboundedSender<RemoteEvent>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    next_id: AtomicU32,
    candidates: Mutex<Vec<String>>,
    fail_opens: AtomicBool,
}

impl MemoryConnection {
    pub fn pair() -> (Arc<Self>, RemoteEnd) {
        let (to_remote, remote_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let shared = Arc::new(Shared::default());
        let conn = Arc::new(Self {
            shared: shared.clone(),
            to_remote: to_remote.clone(),
            events_tx: events_tx.clone(),
            events_rx: Mutex::new(Some(events_rx)),
            next_id: AtomicU32::new(2),
            candidates: Mutex::new(Vec::new()),
            fail_opens: AtomicBool::new(false),
        });
        let remote = RemoteEnd {
            rx: remote_rx,
            to_remote,
            events: events_tx,
            shared,
            next_id: 1,
            pending: HashMap::new(),
            closed: Vec::new(),
            opened: VecDeque::new(),
        };
        (conn, remote)
    }

    /// The event channel to hand to `pump`. Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    /// A server-side stream that is not announced to the remote end.
    pub fn stream(&self, label: &str) -> Arc<dyn Stream> {
        self.new_stream(self.next_id.fetch_add(2, Ordering::Relaxed), label)
    }

    fn new_stream(&self, id: StreamId, label: &str) -> Arc<MemoryStream> {
        let stream = Arc::new(MemoryStream {
            id,
            label: label.to_string(),
            open: AtomicBool::new(true),
            to_remote: self.to_remote.clone(),
            events: self.events_tx.clone(),
        });
        self.shared.streams.lock().insert(id, stream.clone());
        stream
    }

    /// Candidates applied so far, in order.
    pub fn candidates(&self) -> Vec<String> {
        self.candidates.lock().clone()
    }

    /// Make every following `open_stream` fail.
    pub fn fail_opens(&self) {
        self.fail_opens.store(true, Ordering::Release);
    }
}

impl Connection for MemoryConnection {
    fn open_stream<'a>(&'a self, label: &'a str) -> BoxFuture<'a, PmuxResult<Arc<dyn Stream>>> {
        Box::pin(async move {
            if self.fail_opens.load(Ordering::Acquire) {
                return Err(PmuxError::Transport(format!("cannot open {label:?}")));
            }
            let stream = self.new_stream(self.next_id.fetch_add(2, Ordering::Relaxed), label);
            let _ = self.to_remote.send(RemoteEvent::Opened {
                stream_id: stream.id,
                label: label.to_string(),
            });
            Ok(stream as Arc<dyn Stream>)
        })
    }

    fn accept_offer<'a>(&'a self, offer: &'a str) -> BoxFuture<'a, PmuxResult<String>> {
        Box::pin(async move { Ok(format!("answer to {offer}")) })
    }

    fn add_candidate<'a>(&'a self, candidate: &'a str) -> BoxFuture<'a, PmuxResult<()>> {
        Box::pin(async move {
            self.candidates.lock().push(candidate.to_string());
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let streams: Vec<_> = self.shared.streams.lock().drain().map(|(_, s)| s).collect();
            for stream in streams {
                stream.close().await;
            }
        })
    }
}

/// The client side of a [`MemoryConnection`].
pub struct RemoteEnd {
    rx: mpsc::UnboundedReceiver<RemoteEvent>,
    to_remote: mpsc::UnboundedSender<RemoteEvent>,
    events: mpsc::Sender<TransportEvent>,
    shared: Arc<Shared>,
    next_id: StreamId,
    pending: HashMap<StreamId, VecDeque<Vec<u8>>>,
    closed: Vec<StreamId>,
    opened: VecDeque<(StreamId, String)>,
}

impl RemoteEnd {
    pub async fn ready(&self) {
        self.inject(TransportEvent::Ready).await;
    }

    /// Open a stream from the client side.
    pub async fn open(&mut self, label: &str) -> StreamId {
        let id = self.next_id;
        self.next_id += 2;
        let stream = Arc::new(MemoryStream {
            id,
            label: label.to_string(),
            open: AtomicBool::new(true),
            to_remote: self.to_remote.clone(),
            events: self.events.clone(),
        });
        self.shared.streams.lock().insert(id, stream.clone());
        self.inject(TransportEvent::StreamOpened(stream)).await;
        id
    }

    pub async fn send(&self, stream_id: StreamId, data: &[u8]) {
        self.inject(TransportEvent::Message {
            stream_id,
            data: data.to_vec(),
        })
        .await;
    }

    pub async fn send_control(&self, stream_id: StreamId, msg: &CtrlMessage) {
        let data = encode_control(msg).unwrap();
        self.send(stream_id, &data).await;
    }

    /// Close a stream from the client side.
    pub async fn close(&self, stream_id: StreamId) {
        if let Some(stream) = self.shared.streams.lock().remove(&stream_id) {
            stream.open.store(false, Ordering::Release);
        }
        self.inject(TransportEvent::StreamClosed(stream_id)).await;
    }

    pub async fn disconnect(&self, reason: &str) {
        let streams: Vec<_> = self.shared.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.open.store(false, Ordering::Release);
        }
        self.inject(TransportEvent::Closed {
            reason: reason.to_string(),
        })
        .await;
    }

    async fn inject(&self, event: TransportEvent) {
        self.events.send(event).await.unwrap();
    }

    /// Next raw event from the server.
    pub async fn next(&mut self) -> Option<RemoteEvent> {
        tokio::time::timeout(DEFAULT_WAIT, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    fn route(&mut self, event: RemoteEvent) {
        match event {
            RemoteEvent::Opened { stream_id, label } => self.opened.push_back((stream_id, label)),
            RemoteEvent::Data { stream_id, data } => {
                self.pending.entry(stream_id).or_default().push_back(data)
            }
            RemoteEvent::Closed(id) => self.closed.push(id),
        }
    }

    async fn pull(&mut self, deadline: tokio::time::Instant, what: &str) {
        match tokio::time::timeout_at(deadline, self.rx.recv()).await {
            Ok(Some(event)) => self.route(event),
            Ok(None) => panic!("server side dropped while waiting for {what}"),
            Err(_) => panic!("timed out waiting for {what}"),
        }
    }

    /// Next message on one stream. Panics on timeout.
    pub async fn recv_message(&mut self, stream_id: StreamId) -> Vec<u8> {
        let deadline = tokio::time::Instant::now() + DEFAULT_WAIT;
        loop {
            if let Some(data) = self.pending.get_mut(&stream_id).and_then(|q| q.pop_front()) {
                return data;
            }
            self.pull(deadline, &format!("a message on stream {stream_id}"))
                .await;
        }
    }

    pub async fn recv_control(&mut self, stream_id: StreamId) -> CtrlMessage {
        let data = self.recv_message(stream_id).await;
        decode_control(&data).unwrap()
    }

    /// The next stream opened by the server.
    pub async fn accept(&mut self) -> (StreamId, String) {
        let deadline = tokio::time::Instant::now() + DEFAULT_WAIT;
        loop {
            if let Some(opened) = self.opened.pop_front() {
                return opened;
            }
            self.pull(deadline, "a server-opened stream").await;
        }
    }

    /// Collect a stream's messages until the output contains `needle`.
    pub async fn read_until(&mut self, stream_id: StreamId, needle: &str, wait: Duration) -> Vec<u8> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut out = Vec::new();
        loop {
            while let Some(data) = self.pending.get_mut(&stream_id).and_then(|q| q.pop_front()) {
                out.extend_from_slice(&data);
                if String::from_utf8_lossy(&out).contains(needle) {
                    return out;
                }
            }
            self.pull(deadline, &format!("{needle:?} on stream {stream_id}"))
                .await;
        }
    }

    /// Collect a stream's messages until the server closes it.
    pub async fn collect_until_closed(&mut self, stream_id: StreamId, wait: Duration) -> Vec<u8> {
        let deadline = tokio::time::Instant::now() + wait;
        while !self.closed.contains(&stream_id) {
            self.pull(deadline, &format!("stream {stream_id} to close"))
                .await;
        }
        self.drain(stream_id)
    }

    /// Everything received on a stream so far, without waiting.
    pub fn drain(&mut self, stream_id: StreamId) -> Vec<u8> {
        while let Ok(event) = self.rx.try_recv() {
            self.route(event);
        }
        self.pending
            .remove(&stream_id)
            .map(|q| q.into_iter().flatten().collect())
            .unwrap_or_default()
    }

    /// Whether the server has closed the stream, without waiting.
    pub fn is_closed(&mut self, stream_id: StreamId) -> bool {
        while let Ok(event) = self.rx.try_recv() {
            self.route(event);
        }
        self.closed.contains(&stream_id)
    }
}
