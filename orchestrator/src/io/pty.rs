//! Worker processes attached to a pseudo-terminal.
//!
//! Output is read on a dedicated thread and pushed into a bounded channel
//! with `blocking_send`. When the consumer falls behind, the thread stops
//! reading and the kernel applies flow control to the worker. A second
//! thread waits for the child and reports its exit code once.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;

use anyhow::{Context, Result, anyhow};
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

const READ_BUFFER_BYTES: usize = 4096;

/// Program, arguments and environment for one worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// `None` when the exit status could not be collected.
    pub code: Option<i32>,
}

/// Handles for writing to, resizing and killing a running worker.
pub struct WorkerControl {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl std::fmt::Debug for WorkerControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerControl").finish_non_exhaustive()
    }
}

impl WorkerControl {
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("pty writer lock poisoned"))?;
        writer.write_all(data).context("write to pty")?;
        writer.flush().context("flush pty")?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .lock()
            .map_err(|_| anyhow!("pty master lock poisoned"))?
            .resize(pty_size(cols, rows))
            .context("resize pty")
    }

    pub fn kill(&self) -> Result<()> {
        self.killer
            .lock()
            .map_err(|_| anyhow!("pty killer lock poisoned"))?
            .kill()
            .context("kill worker")
    }
}

/// A spawned worker: control handles plus its output and exit streams.
#[derive(Debug)]
pub struct WorkerProcess {
    pub pid: Option<u32>,
    pub control: WorkerControl,
    pub output: mpsc::Receiver<Vec<u8>>,
    pub exit: oneshot::Receiver<WorkerExit>,
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Spawn `command` on a fresh PTY. Must not be called from an async context
/// that cannot block: opening the PTY and forking are synchronous.
#[instrument(skip_all, fields(program = %command.program, cwd = %command.cwd.display()))]
pub fn spawn_worker(command: &WorkerCommand, channel_capacity: usize) -> Result<WorkerProcess> {
    let pair = native_pty_system()
        .openpty(pty_size(command.cols, command.rows))
        .context("open pty")?;

    let mut cmd = CommandBuilder::new(&command.program);
    cmd.cwd(&command.cwd);
    for arg in &command.args {
        cmd.arg(arg);
    }
    for (key, value) in &command.env {
        cmd.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .with_context(|| format!("spawn worker '{}'", command.program))?;
    // The parent's slave handle would keep the reader from seeing EOF.
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();
    let reader = pair.master.try_clone_reader().context("clone pty reader")?;
    let writer = pair.master.take_writer().context("take pty writer")?;

    let (output_tx, output_rx) = mpsc::channel(channel_capacity.max(1));
    let (exit_tx, exit_rx) = oneshot::channel();

    let label = pid.map_or_else(|| "worker".to_string(), |p| p.to_string());
    thread::Builder::new()
        .name(format!("pty-read-{label}"))
        .spawn(move || pump_output(reader, &output_tx))
        .context("spawn pty reader thread")?;
    thread::Builder::new()
        .name(format!("pty-wait-{label}"))
        .spawn(move || {
            let code = match child.wait() {
                Ok(status) => i32::try_from(status.exit_code()).ok(),
                Err(err) => {
                    warn!(err = %err, "failed to wait for worker");
                    None
                }
            };
            debug!(?code, "worker exited");
            let _ = exit_tx.send(WorkerExit { code });
        })
        .context("spawn pty wait thread")?;

    debug!(?pid, "worker spawned");
    Ok(WorkerProcess {
        pid,
        control: WorkerControl {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
        },
        output: output_rx,
        exit: exit_rx,
    })
}

fn pump_output(mut reader: Box<dyn Read + Send>, tx: &mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; READ_BUFFER_BYTES];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            // EIO once the worker and its children close the terminal.
            Err(_) => break,
        }
    }
}
