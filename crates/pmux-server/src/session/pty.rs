//! PTY wrapper using portable-pty.
//!
//! Spawns a command on a pseudo-terminal in a given working directory,
//! providing blocking read/write, resize and kill.

use parking_lot::Mutex;
use pmux_core::{Dimensions, PmuxError, PmuxResult};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// What to run and where.
#[derive(Debug, Clone)]
pub struct SpawnRequest<'a> {
    pub command: &'a [String],
    pub cwd: &'a Path,
    pub env: &'a HashMap<String, String>,
    /// `None` opens the terminal with the system default size.
    pub dimensions: Option<Dimensions>,
}

/// A managed PTY instance.
pub struct PtyHandle {
    /// Taken once by the pane's reader thread.
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    /// `None` once the terminal is closed.
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    /// The master for resize operations.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    /// Child process handle.
    child: Mutex<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Spawn a new PTY running `req.command`.
    pub fn spawn(req: SpawnRequest<'_>) -> PmuxResult<Self> {
        let (program, args) = req
            .command
            .split_first()
            .ok_or_else(|| PmuxError::Spawn("empty command".into()))?;

        let pty_system = native_pty_system();
        let size = req.dimensions.map(pty_size).unwrap_or_default();
        let pair = pty_system
            .openpty(size)
            .map_err(|e| PmuxError::Pty(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.cwd(req.cwd);
        for (key, value) in req.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PmuxError::Spawn(format!("failed launching {:?}: {e}", req.command)))?;
        let pid = child.process_id();

        info!(?pid, command = ?req.command, cwd = %req.cwd.display(), "PTY spawned");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PmuxError::Pty(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PmuxError::Pty(format!("failed to take PTY writer: {e}")))?;

        Ok(Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            master: Mutex::new(Some(pair.master)),
            child: Mutex::new(child),
            pid,
        })
    }

    /// Hand the output side to the reader loop. Returns `None` after the
    /// first call.
    pub fn take_reader(&self) -> Option<Box<dyn Read + Send>> {
        self.reader.lock().take()
    }

    /// Write to the PTY input. Blocks, so call it from `spawn_blocking`.
    pub fn write_blocking(&self, data: &[u8]) -> PmuxResult<()> {
        let mut writer = self.writer.lock();
        let writer = writer.as_mut().ok_or(PmuxError::StreamClosed)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Resize the PTY.
    pub fn resize(&self, dimensions: Dimensions) -> PmuxResult<()> {
        let master = self.master.lock();
        let master = master.as_ref().ok_or(PmuxError::StreamClosed)?;
        master
            .resize(pty_size(dimensions))
            .map_err(|e| PmuxError::Pty(format!("PTY resize failed: {e}")))?;
        debug!(%dimensions, "PTY resized");
        Ok(())
    }

    /// Kill the child and close the terminal. Errors from a child that has
    /// already exited are ignored.
    pub fn kill(&self) {
        if let Err(e) = self.child.lock().kill() {
            debug!(pid = ?self.pid, "kill: {e}");
        }
        // A writer blocked mid-write keeps its lock; it fails on its own once
        // the child is gone.
        if let Some(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        self.master.lock().take();
    }

    /// Current working directory of the child process.
    pub fn cwd(&self) -> PmuxResult<PathBuf> {
        let pid = self
            .pid
            .ok_or_else(|| PmuxError::Spawn("parent pane has no process id".into()))?;
        cwd_of(pid)
    }
}

/// Working directory of a running process.
pub fn cwd_of(pid: u32) -> PmuxResult<PathBuf> {
    std::fs::read_link(format!("/proc/{pid}/cwd"))
        .map_err(|e| PmuxError::Spawn(format!("failed getting cwd of process {pid}: {e}")))
}

fn pty_size(dimensions: Dimensions) -> PtySize {
    PtySize {
        rows: dimensions.rows,
        cols: dimensions.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
