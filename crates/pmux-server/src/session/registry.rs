//! Pane registry.
//!
//! Owns pane id assignment. Ids increase monotonically and are never reused,
//! even after a pane is deleted. Stopped panes stay registered until they
//! are explicitly deleted.

use super::pane::{Pane, PaneId};
use pmux_core::{PmuxError, PmuxResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

/// Tracks every pane of the process.
#[derive(Default)]
pub struct PaneRegistry {
    /// Highest id handed out. Held for the whole of `add` so ids stay
    /// dense when a build fails.
    last_id: Mutex<PaneId>,
    panes: RwLock<HashMap<PaneId, Arc<Pane>>>,
}

impl PaneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pane under the next id and register it. If `build` fails
    /// nothing is registered and the id is not consumed.
    ///
    /// `build` forks the child, so it runs on the blocking pool; lookups are
    /// not held up while it runs.
    pub async fn add<F>(&self, build: F) -> PmuxResult<Arc<Pane>>
    where
        F: FnOnce(PaneId) -> PmuxResult<Pane> + Send + 'static,
    {
        let mut last_id = self.last_id.lock().await;
        let id = *last_id + 1;
        let pane = tokio::task::spawn_blocking(move || build(id))
            .await
            .map_err(|e| PmuxError::Spawn(format!("pane build task failed: {e}")))??;
        let pane = Arc::new(pane);
        *last_id = id;
        self.panes.write().await.insert(id, pane.clone());
        info!(pane_id = id, command = ?pane.command, "pane registered");
        Ok(pane)
    }

    pub async fn get(&self, id: PaneId) -> Option<Arc<Pane>> {
        self.panes.read().await.get(&id).cloned()
    }

    /// All panes, ordered by id.
    pub async fn all(&self) -> Vec<Arc<Pane>> {
        let mut panes: Vec<_> = self.panes.read().await.values().cloned().collect();
        panes.sort_by_key(|p| p.id);
        panes
    }

    pub async fn delete(&self, id: PaneId) -> PmuxResult<Arc<Pane>> {
        match self.panes.write().await.remove(&id) {
            Some(pane) => {
                info!(pane_id = id, "pane removed");
                Ok(pane)
            }
            None => Err(PmuxError::PaneNotFound(id)),
        }
    }

    pub async fn count(&self) -> usize {
        self.panes.read().await.len()
    }
}
