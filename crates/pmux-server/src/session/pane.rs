//! A pane: one command running on a PTY, its output history, and the loops
//! that fan its output out to subscribed streams.
//!
//! Output flows PTY -> reader thread -> bounded queue -> sender task ->
//! ring buffer, screen snapshot, subscribers. A full queue blocks the reader,
//! which in turn stalls the child once the PTY fills up.

use super::pty::{PtyHandle, SpawnRequest};
use super::ring_buffer::RingBuffer;
use super::snapshot::Snapshot;
use super::subscriptions::{Subscription, SubscriptionId, SubscriptionRegistry};
use crate::config::PaneSettings;
use parking_lot::Mutex;
use pmux_core::{Dimensions, PmuxError, PmuxResult};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type PaneId = u64;

/// Size of one PTY read.
const READ_CHUNK: usize = 4096;

/// Consecutive empty reads tolerated before the output is considered over.
const MAX_EMPTY_READS: u32 = 3;

/// What to run in a new pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneSpec {
    pub command: Vec<String>,
    /// `None` for a non-interactive command; such panes get no snapshot.
    pub dimensions: Option<Dimensions>,
    /// Pane whose working directory the new one starts in.
    pub parent: Option<PaneId>,
}

/// A replay queued behind the live output already in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRestore {
    pub pane_id: PaneId,
    pub subscription_id: SubscriptionId,
    pub marker: Option<u64>,
}

#[derive(Debug)]
enum Output {
    Data(Vec<u8>),
    Restore(PendingRestore),
    /// The reader stopped; everything before this has been delivered.
    Eof,
}

pub struct Pane {
    pub id: PaneId,
    pub parent: Option<PaneId>,
    pub command: Vec<String>,
    pty: Arc<PtyHandle>,
    running: AtomicBool,
    /// Per-subscriber limit on one send.
    send_timeout: Duration,
    dimensions: Mutex<Option<Dimensions>>,
    buffer: Mutex<RingBuffer>,
    snapshot: Mutex<Option<Snapshot>>,
    out_tx: mpsc::Sender<Output>,
    /// Taken by `run`.
    out_rx: Mutex<Option<mpsc::Receiver<Output>>>,
    cancel: CancellationToken,
    subscriptions: Arc<SubscriptionRegistry>,
}

impl Pane {
    /// Start `spec.command` in `cwd`. The pane produces no output until
    /// [`Pane::run`] is called.
    pub fn create(
        id: PaneId,
        spec: &PaneSpec,
        cwd: &Path,
        settings: &PaneSettings,
        subscriptions: Arc<SubscriptionRegistry>,
    ) -> PmuxResult<Self> {
        let pty = PtyHandle::spawn(SpawnRequest {
            command: &spec.command,
            cwd,
            env: &settings.env,
            dimensions: spec.dimensions,
        })?;
        let (out_tx, out_rx) = mpsc::channel(settings.queue_capacity.max(1));

        Ok(Self {
            id,
            parent: spec.parent,
            command: spec.command.clone(),
            pty: Arc::new(pty),
            running: AtomicBool::new(true),
            send_timeout: settings.send_timeout,
            dimensions: Mutex::new(spec.dimensions),
            buffer: Mutex::new(RingBuffer::new(settings.buffer_size)),
            snapshot: Mutex::new(spec.dimensions.map(Snapshot::new)),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            cancel: CancellationToken::new(),
            subscriptions,
        })
    }

    /// Start the reader and sender loops. Later calls do nothing.
    pub fn run(self: &Arc<Self>) {
        let Some(rx) = self.out_rx.lock().take() else {
            return;
        };
        let Some(reader) = self.pty.take_reader() else {
            return;
        };

        let (id, tx, cancel) = (self.id, self.out_tx.clone(), self.cancel.clone());
        tokio::task::spawn_blocking(move || read_loop(id, reader, tx, cancel));

        let pane = self.clone();
        tokio::spawn(async move { pane.send_loop(rx).await });
        debug!(pane_id = self.id, "pane loops started");
    }

    async fn send_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Output>) {
        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            match item {
                Output::Data(data) => self.deliver(&data).await,
                Output::Restore(req) => self.replay(req).await,
                Output::Eof => {
                    // Refuse new restores but replay the ones already queued.
                    rx.close();
                    while let Some(item) = rx.recv().await {
                        match item {
                            Output::Data(data) => self.deliver(&data).await,
                            Output::Restore(req) => self.replay(req).await,
                            Output::Eof => {}
                        }
                    }
                    self.kill().await;
                    break;
                }
            }
        }
        debug!(pane_id = self.id, "sender loop exited");
    }

    async fn deliver(&self, data: &[u8]) {
        self.buffer.lock().append(data);
        if let Some(snapshot) = self.snapshot.lock().as_mut() {
            snapshot.process(data);
        }

        for sub in self.subscriptions.for_pane(self.id).await {
            if sub.awaiting_restore() {
                continue;
            }
            if !sub.stream.is_open() {
                debug!(pane_id = self.id, stream_id = sub.stream_id(), "dropping closed subscriber");
                let _ = self.subscriptions.remove(sub.id).await;
                sub.stream.close().await;
                continue;
            }
            self.send_to(&sub, data).await;
        }
    }

    /// Send one chunk to one subscriber. A subscriber whose send fails or
    /// does not finish within the send timeout is unsubscribed and closed.
    async fn send_to(&self, sub: &Subscription, data: &[u8]) -> bool {
        let err = match tokio::time::timeout(self.send_timeout, sub.stream.send(data)).await {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("stalled for {:?}", self.send_timeout),
        };
        warn!(pane_id = self.id, stream_id = sub.stream_id(), "send failed, dropping subscriber: {err}");
        let _ = self.subscriptions.remove(sub.id).await;
        sub.stream.close().await;
        false
    }

    async fn replay(&self, req: PendingRestore) {
        let Some(sub) = self.subscriptions.get(req.subscription_id).await else {
            debug!(pane_id = self.id, subscription_id = req.subscription_id, "restore target gone");
            return;
        };
        let data = self.replay_data(req.marker);
        info!(
            pane_id = self.id,
            stream_id = sub.stream_id(),
            marker = ?req.marker,
            bytes = data.len(),
            "restoring"
        );
        if !data.is_empty() && !self.send_to(&sub, &data).await {
            return;
        }
        sub.restored();
    }

    fn replay_data(&self, marker: Option<u64>) -> Vec<u8> {
        if marker.is_none() {
            if let Some(snapshot) = self.snapshot.lock().as_ref() {
                return snapshot.dump();
            }
        }
        self.buffer.lock().take_since(marker)
    }

    /// Queue a replay for a subscription. The subscription must have been
    /// added with `awaiting_restore` so live output skips it until then.
    pub async fn restore(&self, subscription_id: SubscriptionId, marker: Option<u64>) -> PmuxResult<()> {
        if !self.is_running() {
            return Err(PmuxError::PaneNotRunning(self.id));
        }
        let req = PendingRestore {
            pane_id: self.id,
            subscription_id,
            marker,
        };
        self.out_tx
            .send(Output::Restore(req))
            .await
            .map_err(|_| PmuxError::PaneNotRunning(self.id))
    }

    /// Forward client input to the PTY. A failed write kills the pane.
    pub async fn write(&self, data: Vec<u8>) {
        if !self.is_running() {
            debug!(pane_id = self.id, "dropping input for stopped pane");
            return;
        }
        let pty = self.pty.clone();
        let result = tokio::task::spawn_blocking(move || pty.write_blocking(&data)).await;
        let err = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        warn!(pane_id = self.id, "pty write failed: {err}");
        self.kill().await;
    }

    /// Resize the terminal. Does nothing when the size is unchanged.
    pub fn resize(&self, dimensions: Dimensions) -> PmuxResult<()> {
        if !self.is_running() {
            return Err(PmuxError::PaneNotRunning(self.id));
        }
        let mut current = self.dimensions.lock();
        if *current == Some(dimensions) {
            return Ok(());
        }
        self.pty.resize(dimensions)?;
        *current = Some(dimensions);
        if let Some(snapshot) = self.snapshot.lock().as_mut() {
            snapshot.resize(dimensions);
        }
        info!(pane_id = self.id, %dimensions, "pane resized");
        Ok(())
    }

    /// Record the current output position under `marker`.
    pub fn mark(&self, marker: u64) {
        self.buffer.lock().mark(marker);
    }

    /// Stop the pane: close and unsubscribe its streams, stop the loops, kill
    /// the process and close the terminal. Safe to call more than once.
    pub async fn kill(&self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        if was_running {
            self.cancel.cancel();
            // The child gets a grace period after SIGHUP; wait it out off the runtime.
            let pty = self.pty.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || pty.kill()).await {
                warn!(pane_id = self.id, "pty kill task failed: {e}");
            }
        }
        for sub in self.subscriptions.for_pane(self.id).await {
            let _ = self.subscriptions.remove(sub.id).await;
            sub.stream.close().await;
        }
        if was_running {
            let buffered = self.buffer.lock().len();
            info!(pane_id = self.id, buffered, "pane killed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn dimensions(&self) -> Option<Dimensions> {
        *self.dimensions.lock()
    }

    /// Working directory of the pane's process.
    pub fn cwd(&self) -> PmuxResult<PathBuf> {
        self.pty.cwd()
    }

    /// First message on a stream opened for a new pane: the id, plus the
    /// size for sized panes.
    pub fn preamble(&self) -> String {
        match self.dimensions() {
            Some(d) => format!("{},{d}", self.id),
            None => self.id.to_string(),
        }
    }
}

fn read_loop(
    pane_id: PaneId,
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Output>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut empty_reads = 0;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match reader.read(&mut buf) {
            Ok(0) => {
                empty_reads += 1;
                if empty_reads > MAX_EMPTY_READS {
                    debug!(pane_id, "end of output");
                    break;
                }
            }
            Ok(n) => {
                empty_reads = 0;
                // A read that finished after cancellation is discarded.
                if cancel.is_cancelled() {
                    break;
                }
                if tx.blocking_send(Output::Data(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO once the child side of the PTY is gone.
                debug!(pane_id, "pty read ended: {e}");
                break;
            }
        }
    }
    let _ = tx.blocking_send(Output::Eof);
}
