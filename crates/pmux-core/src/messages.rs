//! Control-channel message shapes.
//!
//! Every message on the control stream is a JSON envelope:
//! `{"time": <ms>, "message_id": <ref>, "type": <string>, "args": <object>}`.
//! Requests are answered by exactly one `ack` or `nack` whose args carry
//! the request's `message_id` as `ref`.

use crate::error::{PmuxError, PmuxResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Label of the command & control stream.
pub const CONTROL_LABEL: &str = "%";

/// Wire value meaning "no replay marker".
pub const NO_MARKER: i64 = -1;

/// A control message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CtrlMessage {
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub time: i64,
    /// Correlation id, echoed as `ref` in the ack/nack.
    #[serde(alias = "ref")]
    pub message_id: u64,
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl CtrlMessage {
    /// Build an envelope stamped with the current wall clock.
    pub fn new(message_id: u64, msg_type: &str, args: serde_json::Value) -> Self {
        let time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self {
            time,
            message_id,
            msg_type: msg_type.to_string(),
            args,
        }
    }

    /// Interpret the envelope as a typed request.
    ///
    /// Returns `Ok(None)` for a type this side does not know, and an error
    /// when the type is known but its args do not parse.
    pub fn request(&self) -> PmuxResult<Option<ControlRequest>> {
        let req = match self.msg_type.as_str() {
            "add_pane" => ControlRequest::AddPane(self.parse_args()?),
            "resize" => ControlRequest::Resize(self.parse_args()?),
            "reconnect_pane" => ControlRequest::ReconnectPane(self.parse_args()?),
            "mark" => ControlRequest::Mark,
            "restore" => ControlRequest::Restore(self.parse_args()?),
            "get_payload" => ControlRequest::GetPayload,
            "set_payload" => ControlRequest::SetPayload(self.parse_args()?),
            "ack" => ControlRequest::Ack(self.parse_args()?),
            "nack" => ControlRequest::Nack(self.parse_args()?),
            _ => return Ok(None),
        };
        Ok(Some(req))
    }

    fn parse_args<T: serde::de::DeserializeOwned>(&self) -> PmuxResult<T> {
        serde_json::from_value(self.args.clone()).map_err(|e| {
            PmuxError::InvalidMessage(format!("invalid arguments for {}: {e}", self.msg_type))
        })
    }
}

/// A typed control request.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    AddPane(AddPaneArgs),
    Resize(ResizeArgs),
    ReconnectPane(ReconnectPaneArgs),
    Mark,
    Restore(RestoreArgs),
    GetPayload,
    SetPayload(SetPayloadArgs),
    Ack(AckArgs),
    Nack(NackArgs),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddPaneArgs {
    pub command: Vec<String>,
    #[serde(default)]
    pub rows: u16,
    #[serde(default)]
    pub cols: u16,
    #[serde(default)]
    pub x: u16,
    #[serde(default)]
    pub y: u16,
    /// Pane whose working directory the new pane inherits. `0` means none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<u64>,
}

impl AddPaneArgs {
    /// Requested dimensions, if both rows and cols were given.
    pub fn dimensions(&self) -> Option<Dimensions> {
        (self.rows > 0 && self.cols > 0).then(|| Dimensions::new(self.rows, self.cols))
    }

    pub fn parent(&self) -> Option<u64> {
        self.parent.filter(|&p| p != 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeArgs {
    pub pane_id: u64,
    /// Columns.
    pub sx: u16,
    /// Rows.
    pub sy: u16,
}

impl ResizeArgs {
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.sy, self.sx)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPaneArgs {
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreArgs {
    pub marker: i64,
}

impl RestoreArgs {
    /// The marker as an id, or `None` for the "no marker" sentinel.
    pub fn marker(&self) -> Option<u64> {
        u64::try_from(self.marker).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPayloadArgs {
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckArgs {
    #[serde(rename = "ref")]
    pub reference: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NackArgs {
    #[serde(rename = "ref")]
    pub reference: u64,
    #[serde(default)]
    pub desc: String,
}

/// Terminal dimensions. Text form is `<rows>x<cols>`, e.g. `24x80`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub rows: u16,
    pub cols: u16,
}

impl Dimensions {
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

impl FromStr for Dimensions {
    type Err = PmuxError;

    fn from_str(s: &str) -> PmuxResult<Self> {
        let (rows, cols) = s
            .split_once('x')
            .ok_or_else(|| PmuxError::InvalidLabel(format!("bad dimensions: {s:?}")))?;
        let rows = rows
            .trim()
            .parse::<u16>()
            .map_err(|e| PmuxError::InvalidLabel(format!("bad rows in {s:?}: {e}")))?;
        let cols = cols
            .trim()
            .parse::<u16>()
            .map_err(|e| PmuxError::InvalidLabel(format!("bad cols in {s:?}: {e}")))?;
        if rows == 0 || cols == 0 {
            return Err(PmuxError::InvalidLabel(format!("zero dimension in {s:?}")));
        }
        Ok(Self { rows, cols })
    }
}
