use thiserror::Error;

/// Errors produced by the pane engine and its protocol layer.
#[derive(Debug, Error)]
pub enum PmuxError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid stream label: {0}")]
    InvalidLabel(String),

    #[error("pane not found: {0}")]
    PaneNotFound(u64),

    #[error("pane {0} is not running")]
    PaneNotRunning(u64),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(u64),

    #[error("failed to spawn command: {0}")]
    Spawn(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("stream closed")]
    StreamClosed,

    /// The remote side answered a request with a nack.
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("timed out waiting for ack of message {0}")]
    AckTimeout(u64),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for PmuxError {
    fn from(e: serde_json::Error) -> Self {
        PmuxError::Codec(e.to_string())
    }
}

pub type PmuxResult<T> = Result<T, PmuxError>;
