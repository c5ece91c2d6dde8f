//! pmux-core: shared protocol library for the pane multiplexer.
//!
//! Provides the control-channel message types, JSON and mux-frame codecs,
//! the stream label grammar, and the abstract transport traits.

pub mod codec;
pub mod error;
pub mod label;
pub mod messages;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{decode_control, encode_control, FrameKind, MuxFrame};
pub use error::{PmuxError, PmuxResult};
pub use label::StreamLabel;
pub use messages::{ControlRequest, CtrlMessage, Dimensions, CONTROL_LABEL, NO_MARKER};
pub use transport::{pump, Connection, ConnectionHandler, Stream, StreamId, TransportEvent};
