//! Control stream request handlers.

use super::Peer;
use crate::session::PaneSpec;
use pmux_core::messages::{
    AckArgs, AddPaneArgs, NackArgs, ReconnectPaneArgs, ResizeArgs, RestoreArgs, SetPayloadArgs,
};
use pmux_core::{decode_control, ControlRequest, CtrlMessage, Dimensions, PmuxError, PmuxResult};
use tracing::{debug, info, warn};

impl Peer {
    pub(super) async fn handle_control(&self, data: &[u8]) {
        let msg = match decode_control(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer_id = self.id, "dropping unparsable control message: {e}");
                return;
            }
        };
        debug!(peer_id = self.id, msg_type = %msg.msg_type, message_id = msg.message_id, "control message");

        let request = match msg.request() {
            Ok(Some(request)) => request,
            Ok(None) => {
                warn!(peer_id = self.id, msg_type = %msg.msg_type, "ignoring unknown control message");
                return;
            }
            Err(e) if matches!(msg.msg_type.as_str(), "ack" | "nack") => {
                warn!(peer_id = self.id, "malformed {}: {e}", msg.msg_type);
                return;
            }
            Err(e) => {
                self.reply(&msg, Err(e)).await;
                return;
            }
        };

        let result = match request {
            ControlRequest::AddPane(args) => self.on_add_pane(&msg, args).await,
            ControlRequest::Resize(args) => self.on_resize(args).await,
            ControlRequest::ReconnectPane(args) => self.on_reconnect_pane(&msg, args).await,
            ControlRequest::Mark => self.on_mark().await,
            ControlRequest::Restore(args) => self.on_restore(args),
            ControlRequest::GetPayload => Ok(self.state.payload()),
            ControlRequest::SetPayload(args) => self.on_set_payload(args).await,
            ControlRequest::Ack(args) => {
                self.on_ack(args);
                return;
            }
            ControlRequest::Nack(args) => {
                self.on_nack(args);
                return;
            }
        };
        self.reply(&msg, result).await;
    }

    async fn reply(&self, msg: &CtrlMessage, result: PmuxResult<String>) {
        let sent = match result {
            Ok(body) => self.ack(msg.message_id, &body).await,
            Err(e) => {
                info!(peer_id = self.id, msg_type = %msg.msg_type, "request failed: {e}");
                self.nack(msg.message_id, &e.to_string()).await
            }
        };
        if let Err(e) = sent {
            warn!(peer_id = self.id, message_id = msg.message_id, "reply not sent: {e}");
        }
    }

    async fn on_add_pane(&self, msg: &CtrlMessage, args: AddPaneArgs) -> PmuxResult<String> {
        let spec = PaneSpec {
            dimensions: Some(args.dimensions().unwrap_or_default()),
            parent: args.parent(),
            command: args.command,
        };
        let pane = self.state.spawn_pane(spec).await?;

        let stream = match self
            .conn
            .open_stream(&format!("{}:{}", msg.message_id, pane.id))
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.discard_pane(&pane).await;
                return Err(e);
            }
        };
        if let Err(e) = self.attach(&stream, &pane).await {
            self.discard_pane(&pane).await;
            stream.close().await;
            return Err(e);
        }
        pane.run();
        Ok(pane.id.to_string())
    }

    async fn on_resize(&self, args: ResizeArgs) -> PmuxResult<String> {
        let pane = self
            .state
            .panes
            .get(args.pane_id)
            .await
            .ok_or(PmuxError::PaneNotFound(args.pane_id))?;
        let dimensions: Dimensions = args.dimensions();
        pane.resize(dimensions)?;
        self.broadcast("resize", serde_json::to_value(&args)?).await;
        Ok(String::new())
    }

    async fn on_reconnect_pane(
        &self,
        msg: &CtrlMessage,
        args: ReconnectPaneArgs,
    ) -> PmuxResult<String> {
        let pane = self
            .state
            .panes
            .get(args.id)
            .await
            .ok_or(PmuxError::PaneNotFound(args.id))?;
        if !pane.is_running() {
            return Err(PmuxError::PaneNotRunning(pane.id));
        }

        let stream = self
            .conn
            .open_stream(&format!("{}:{}", msg.message_id, pane.id))
            .await?;
        if let Err(e) = self.reattach(&stream, pane.id).await {
            stream.close().await;
            return Err(e);
        }
        Ok(pane.id.to_string())
    }

    /// Mark every pane this peer is attached to and remember the marker.
    async fn on_mark(&self) -> PmuxResult<String> {
        let marker = self.state.next_marker();
        let mut panes = Vec::new();
        for sub in self.state.subscriptions.for_peer(self.id).await {
            if panes.contains(&sub.pane_id) {
                continue;
            }
            if let Some(pane) = self.state.panes.get(sub.pane_id).await {
                pane.mark(marker);
                panes.push(pane.id);
            }
        }
        *self.marker.lock() = Some(marker);
        debug!(peer_id = self.id, marker, ?panes, "marked");
        Ok(marker.to_string())
    }

    fn on_restore(&self, args: RestoreArgs) -> PmuxResult<String> {
        *self.marker.lock() = args.marker();
        Ok(self.state.payload())
    }

    async fn on_set_payload(&self, args: SetPayloadArgs) -> PmuxResult<String> {
        let payload = match &args.payload {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.state.set_payload(payload.clone());
        self.broadcast("set_payload", serde_json::json!({ "payload": args.payload }))
            .await;
        Ok(payload)
    }

    fn on_ack(&self, args: AckArgs) {
        match self.waiting.lock().remove(&args.reference) {
            Some(tx) => {
                let _ = tx.send(Ok(args.body));
            }
            None => debug!(peer_id = self.id, reference = args.reference, "unsolicited ack"),
        }
    }

    fn on_nack(&self, args: NackArgs) {
        match self.waiting.lock().remove(&args.reference) {
            Some(tx) => {
                let _ = tx.send(Err(args.desc));
            }
            None => warn!(
                peer_id = self.id,
                reference = args.reference,
                desc = %args.desc,
                "unsolicited nack"
            ),
        }
    }
}
