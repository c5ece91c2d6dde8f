//! Abstract transport traits for pmux.
//!
//! A transport offers one connection carrying many independent, ordered,
//! reliable message streams. Implementations push what happens on the
//! connection into an mpsc channel of [`TransportEvent`]s; [`pump`] feeds
//! those events to a [`ConnectionHandler`] one at a time.

use crate::error::PmuxResult;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Identifies a stream within one connection.
pub type StreamId = u32;

/// A boxed, sendable future. Keeps the transport traits object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One message stream of a connection.
pub trait Stream: Send + Sync {
    fn id(&self) -> StreamId;

    /// The label the stream was opened with.
    fn label(&self) -> &str;

    /// Send one message. Fails once the stream is closed.
    fn send<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, PmuxResult<()>>;

    fn is_open(&self) -> bool;

    /// Close the stream. Closing twice is harmless.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// One transport connection.
pub trait Connection: Send + Sync {
    /// Open a stream towards the remote side.
    fn open_stream<'a>(&'a self, label: &'a str) -> BoxFuture<'a, PmuxResult<Arc<dyn Stream>>>;

    /// Apply the remote session description and produce the local answer.
    fn accept_offer<'a>(&'a self, offer: &'a str) -> BoxFuture<'a, PmuxResult<String>>;

    /// Apply one remote connection-setup candidate.
    fn add_candidate<'a>(&'a self, candidate: &'a str) -> BoxFuture<'a, PmuxResult<()>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Something that happened on a connection.
pub enum TransportEvent {
    /// The connection is established and streams may be opened.
    Ready,
    /// The remote side opened a stream.
    StreamOpened(Arc<dyn Stream>),
    /// A message arrived on an open stream.
    Message { stream_id: StreamId, data: Vec<u8> },
    /// A stream was closed by either side.
    StreamClosed(StreamId),
    /// The connection is gone. No further events follow.
    Closed { reason: String },
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => f.write_str("Ready"),
            Self::StreamOpened(s) => f
                .debug_struct("StreamOpened")
                .field("id", &s.id())
                .field("label", &s.label())
                .finish(),
            Self::Message { stream_id, data } => f
                .debug_struct("Message")
                .field("stream_id", stream_id)
                .field("len", &data.len())
                .finish(),
            Self::StreamClosed(id) => f.debug_tuple("StreamClosed").field(id).finish(),
            Self::Closed { reason } => f.debug_struct("Closed").field("reason", reason).finish(),
        }
    }
}

/// The event-driven side of a connection, implemented by the peer.
pub trait ConnectionHandler: Send + Sync {
    fn on_ready(&self) -> impl Future<Output = ()> + Send;

    fn on_stream_open(&self, stream: Arc<dyn Stream>) -> impl Future<Output = ()> + Send;

    fn on_message(&self, stream_id: StreamId, data: Vec<u8>) -> impl Future<Output = ()> + Send;

    fn on_stream_close(&self, stream_id: StreamId) -> impl Future<Output = ()> + Send;

    fn on_closed(&self, reason: &str) -> impl Future<Output = ()> + Send;
}

/// Drive `handler` from a transport's event channel until the connection
/// closes. Events are handled strictly one after another.
pub async fn pump<H: ConnectionHandler>(mut events: mpsc::Receiver<TransportEvent>, handler: &H) {
    while let Some(event) = events.recv().await {
        debug!(?event, "transport event");
        match event {
            TransportEvent::Ready => handler.on_ready().await,
            TransportEvent::StreamOpened(stream) => handler.on_stream_open(stream).await,
            TransportEvent::Message { stream_id, data } => {
                handler.on_message(stream_id, data).await
            }
            TransportEvent::StreamClosed(id) => handler.on_stream_close(id).await,
            TransportEvent::Closed { reason } => {
                handler.on_closed(&reason).await;
                return;
            }
        }
    }
    handler.on_closed("transport event channel closed").await;
}
