//! State shared by every peer: the registries, the out-of-band payload and
//! the marker counter.

use crate::config::{PaneSettings, PeerSettings};
use crate::peer::registry::PeerRegistry;
use crate::session::{Pane, PaneRegistry, PaneSpec, SubscriptionRegistry};
use parking_lot::Mutex;
use pmux_core::{PmuxError, PmuxResult};
use std::sync::Arc;
use tracing::info;

pub struct SharedState {
    pub panes: PaneRegistry,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub peers: PeerRegistry,
    pub pane_settings: PaneSettings,
    pub peer_settings: PeerSettings,
    /// Raw JSON text; empty until a client sets it.
    payload: Mutex<String>,
    last_marker: Mutex<u64>,
}

impl SharedState {
    pub fn new(pane_settings: PaneSettings, peer_settings: PeerSettings) -> Arc<Self> {
        Arc::new(Self {
            panes: PaneRegistry::new(),
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            peers: PeerRegistry::new(),
            pane_settings,
            peer_settings,
            payload: Mutex::new(String::new()),
            last_marker: Mutex::new(0),
        })
    }

    pub fn payload(&self) -> String {
        self.payload.lock().clone()
    }

    /// Replace the payload. The last writer wins.
    pub fn set_payload(&self, payload: String) {
        *self.payload.lock() = payload;
    }

    /// Allocate a process-wide unique marker id.
    pub fn next_marker(&self) -> u64 {
        let mut last = self.last_marker.lock();
        *last += 1;
        *last
    }

    /// Start a pane and register it. The pane is not running yet; the caller
    /// subscribes its stream first and then calls [`Pane::run`].
    ///
    /// A command of `*` starts the user's login shell. A parent pane, if
    /// given, supplies the working directory; otherwise the home directory is
    /// used.
    pub async fn spawn_pane(&self, mut spec: PaneSpec) -> PmuxResult<Arc<Pane>> {
        match spec.command.first_mut() {
            None => return Err(PmuxError::Spawn("empty command".into())),
            Some(program) if program == "*" => *program = login_shell(),
            Some(_) => {}
        }

        let cwd = match spec.parent {
            Some(parent_id) => self
                .panes
                .get(parent_id)
                .await
                .ok_or(PmuxError::PaneNotFound(parent_id))?
                .cwd()?,
            None => dirs::home_dir()
                .ok_or_else(|| PmuxError::Spawn("cannot determine home directory".into()))?,
        };

        let settings = self.pane_settings.clone();
        let subscriptions = self.subscriptions.clone();
        let pane_cwd = cwd.clone();
        let pane = self
            .panes
            .add(move |id| Pane::create(id, &spec, &pane_cwd, &settings, subscriptions))
            .await?;
        info!(pane_id = pane.id, cwd = %cwd.display(), "pane spawned");
        Ok(pane)
    }
}

fn login_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}
