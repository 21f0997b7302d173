// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shell command execution with a hard timeout and heartbeats.
//!
//! Output is read by background tasks into shared buffers, so whatever the
//! command printed before a forced kill is still returned. The command runs
//! in its own process group; on timeout the whole group is killed, which
//! also takes down test runners that fork workers.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, MissedTickBehavior};
use tracing::{debug, warn};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use super::WorkspaceError;

/// How long to wait for output readers after the process is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Receives periodic progress while a command is running.
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    async fn beat(&self, elapsed: Duration);
}

/// Result of a shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    /// `None` when the process was killed or ended by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stdout followed by stderr, for display and failure summaries.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (true, true) => String::new(),
        }
    }
}

/// Run `command` through `sh -c` in `cwd`.
///
/// `sink` is called every `heartbeat` while the command runs. A zero
/// heartbeat disables it. On timeout the process group is killed and the
/// output captured so far is returned with `timed_out = true`.
pub async fn run_shell(
    cwd: &Path,
    command: &str,
    limit: Duration,
    heartbeat: Duration,
    sink: Option<&dyn HeartbeatSink>,
) -> Result<ShellOutput, WorkspaceError> {
    let start = Instant::now();

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let readers = [
        child.stdout.take().map(|s| spawn_reader(s, stdout_buf.clone())),
        child.stderr.take().map(|s| spawn_reader(s, stderr_buf.clone())),
    ];

    let deadline = tokio::time::sleep(limit);
    tokio::pin!(deadline);

    let beats_enabled = sink.is_some() && !heartbeat.is_zero();
    let period = if heartbeat.is_zero() {
        Duration::from_secs(3600)
    } else {
        heartbeat
    };
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut timed_out = false;
    let exit_code = loop {
        tokio::select! {
            status = child.wait() => break status?.code(),
            _ = &mut deadline => {
                warn!(command, timeout_secs = limit.as_secs(), "command timed out, killing process group");
                kill_tree(&mut child).await;
                timed_out = true;
                break None;
            }
            _ = ticker.tick(), if beats_enabled => {
                if let Some(sink) = sink {
                    sink.beat(start.elapsed()).await;
                }
            }
        }
    };

    for reader in readers.into_iter().flatten() {
        if timeout(READER_GRACE, reader).await.is_err() {
            debug!(command, "output reader did not finish after exit");
        }
    }

    let stdout = String::from_utf8_lossy(&stdout_buf.lock().await).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_buf.lock().await).into_owned();
    let duration = start.elapsed();

    #[cfg(feature = "telemetry")]
    GLOBAL_METRICS.record_operation("workspace.run_shell", duration);

    Ok(ShellOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration,
    })
}

fn spawn_reader<R>(mut source: R, buf: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match source.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.lock().await.extend_from_slice(&chunk[..n]),
            }
        }
    })
}

async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        // The child leads its own group, so the group id is its pid.
        if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
            if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                warn!(pid, error = %e, "process group kill failed");
            }
        }
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "child kill after timeout failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingSink(AtomicUsize);

    #[async_trait]
    impl HeartbeatSink for CountingSink {
        async fn beat(&self, _elapsed: Duration) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_success_captures_output() {
        let dir = TempDir::new().unwrap();
        let out = run_shell(
            dir.path(),
            "echo hello; echo oops >&2",
            Duration::from_secs(10),
            Duration::ZERO,
            None,
        )
        .await
        .unwrap();

        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.combined(), "hello\noops");
    }

    #[tokio::test]
    async fn test_exit_code_and_cwd() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let out = run_shell(
            dir.path(),
            "test -f marker.txt && exit 3",
            Duration::from_secs(10),
            Duration::ZERO,
            None,
        )
        .await
        .unwrap();

        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let dir = TempDir::new().unwrap();
        let out = run_shell(
            dir.path(),
            "echo before-sleep; sleep 30; echo never",
            Duration::from_millis(500),
            Duration::ZERO,
            None,
        )
        .await
        .unwrap();

        assert!(out.timed_out);
        assert!(out.exit_code.is_none());
        assert!(out.stdout.contains("before-sleep"));
        assert!(!out.stdout.contains("never"));
        assert!(out.duration < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let dir = TempDir::new().unwrap();
        let out = run_shell(
            dir.path(),
            "(sleep 1; touch late.txt) & sleep 30",
            Duration::from_millis(300),
            Duration::ZERO,
            None,
        )
        .await
        .unwrap();
        assert!(out.timed_out);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!dir.path().join("late.txt").exists());
    }

    #[tokio::test]
    async fn test_heartbeats_fire_while_running() {
        let dir = TempDir::new().unwrap();
        let sink = CountingSink(AtomicUsize::new(0));
        let out = run_shell(
            dir.path(),
            "sleep 1",
            Duration::from_secs(10),
            Duration::from_millis(200),
            Some(&sink),
        )
        .await
        .unwrap();

        assert!(out.success());
        assert!(sink.0.load(Ordering::SeqCst) >= 2);
    }
}
