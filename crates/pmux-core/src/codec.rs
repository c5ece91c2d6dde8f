//! Wire codecs: JSON control envelopes and mux frames.
//!
//! Mux frame format: `[4-byte big-endian stream id][1-byte kind][payload]`.
//! One frame travels in one transport message, so no length prefix is needed.

use crate::error::{PmuxError, PmuxResult};
use crate::messages::CtrlMessage;
use crate::transport::StreamId;

/// Encode a control envelope as JSON bytes.
pub fn encode_control(msg: &CtrlMessage) -> PmuxResult<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

/// Decode a control envelope from JSON bytes.
pub fn decode_control(data: &[u8]) -> PmuxResult<CtrlMessage> {
    Ok(serde_json::from_slice(data)?)
}

const HEADER_LEN: usize = 5;

/// What a mux frame does to its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Open a stream; payload is the UTF-8 label.
    Open = 0,
    /// Deliver one message on an open stream.
    Data = 1,
    /// Close a stream; payload is empty.
    Close = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = PmuxError;

    fn try_from(v: u8) -> PmuxResult<Self> {
        match v {
            0 => Ok(Self::Open),
            1 => Ok(Self::Data),
            2 => Ok(Self::Close),
            other => Err(PmuxError::Codec(format!("unknown frame kind: {other}"))),
        }
    }
}

/// One multiplexed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxFrame {
    pub stream_id: StreamId,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl MuxFrame {
    pub fn open(stream_id: StreamId, label: &str) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Open,
            payload: label.as_bytes().to_vec(),
        }
    }

    pub fn data(stream_id: StreamId, payload: &[u8]) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data,
            payload: payload.to_vec(),
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Close,
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEADER_LEN + self.payload.len());
        frame.extend_from_slice(&self.stream_id.to_be_bytes());
        frame.push(self.kind as u8);
        frame.extend_from_slice(&self.payload);
        frame
    }

    pub fn decode(data: &[u8]) -> PmuxResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(PmuxError::Codec(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }
        let stream_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let kind = FrameKind::try_from(data[4])?;
        Ok(Self {
            stream_id,
            kind,
            payload: data[HEADER_LEN..].to_vec(),
        })
    }

    /// The payload of an `Open` frame as a label.
    pub fn label(&self) -> PmuxResult<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| PmuxError::Codec(format!("label is not utf-8: {e}")))
    }
}
