//! Timed execution for short-lived network helpers (`git push`, `gh pr create`).
//!
//! Worker sessions do not go through here; they run attached to a PTY (see
//! [`super::pty`]).

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Bytes of each stream kept in memory; the rest is drained and dropped.
const CAPTURE_LIMIT: usize = 64 * 1024;

/// A helper command that must finish within `timeout`.
pub struct HelperCommand {
    label: &'static str,
    cmd: Command,
    timeout: Duration,
}

impl HelperCommand {
    pub fn new(label: &'static str, cmd: Command, timeout: Duration) -> Self {
        Self {
            label,
            cmd,
            timeout,
        }
    }

    /// Run to completion and return stdout.
    ///
    /// Timeouts and non-zero exits are errors; a failure message carries stderr.
    #[instrument(skip_all, fields(label = self.label, timeout_secs = self.timeout.as_secs()))]
    pub fn run(mut self) -> Result<String> {
        self.cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = self
            .cmd
            .spawn()
            .with_context(|| format!("spawn {}", self.label))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("{} stdout was not piped", self.label))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("{} stderr was not piped", self.label))?;
        let stdout = thread::spawn(move || capture(stdout));
        let stderr = thread::spawn(move || capture(stderr));

        let status = match child.wait_timeout(self.timeout).context("wait for helper")? {
            Some(status) => status,
            None => {
                warn!("helper timed out, killing");
                child.kill().context("kill helper")?;
                child.wait().context("reap helper")?;
                bail!("{} timed out after {}s", self.label, self.timeout.as_secs());
            }
        };

        let stdout = join(stdout)?;
        let stderr = join(stderr)?;
        debug!(exit_code = ?status.code(), "helper finished");
        if !status.success() {
            bail!("{} failed: {}", self.label, stderr.trim());
        }
        Ok(stdout)
    }
}

fn join(handle: thread::JoinHandle<Result<String>>) -> Result<String> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

/// Read a stream to EOF, keeping at most [`CAPTURE_LIMIT`] bytes.
///
/// The pipe is always drained so the child never blocks on a full buffer.
fn capture<R: Read>(mut reader: R) -> Result<String> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read helper output")?;
        if n == 0 {
            break;
        }
        let room = CAPTURE_LIMIT.saturating_sub(kept.len());
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }
    Ok(String::from_utf8_lossy(&kept).into_owned())
}
