use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::{ExecLimits, ExecResult, Sandbox, SandboxError};

/// Environment variables always forwarded from the parent process.
const BASELINE_ENV: &[&str] = &["PATH", "LANG", "TZ"];

/// How long to keep draining the output pipes after the child has exited.
///
/// Forked or backgrounded descendants inherit the pipe write ends and can
/// hold them open indefinitely; past the grace the collectors are abandoned
/// and whatever was captured stands.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Subprocess-backed sandbox.
///
/// Isolation is process- and filesystem-level: the child runs with its
/// working directory and HOME bound to the session workspace and an
/// environment scrubbed to a minimal baseline plus the configured allowlist.
/// Sufficient for a cooperating-but-untrusted caller; not a substitute for
/// OS-level containment.
#[derive(Debug, Default)]
pub struct SubprocessSandbox;

impl SubprocessSandbox {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sandbox for SubprocessSandbox {
    async fn exec(
        &self,
        cmd: &str,
        args: &[String],
        workspace: &Path,
        limits: &ExecLimits,
    ) -> Result<ExecResult, SandboxError> {
        let started = Instant::now();

        let mut command = Command::new(cmd);
        command
            .args(args)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        scrub_env(&mut command, workspace, &limits.env_allowlist);

        let mut child = command.spawn().map_err(|e| SandboxError::Spawn {
            command: cmd.to_string(),
            source: e,
        })?;

        // Drain both pipes concurrently so the child never blocks on a full
        // pipe, even after the capture ceiling is reached. The collectors
        // write into shared buffers so partial output survives abandonment.
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let (max_lines, max_bytes) = (limits.max_output_lines, limits.max_output_bytes);
        let stdout_cap = Arc::new(Capture::default());
        let stderr_cap = Arc::new(Capture::default());
        let mut stdout_task = tokio::spawn({
            let cap = Arc::clone(&stdout_cap);
            async move {
                if let Some(pipe) = stdout_pipe {
                    collect_capped(pipe, &cap, max_lines, max_bytes).await;
                }
            }
        });
        let mut stderr_task = tokio::spawn({
            let cap = Arc::clone(&stderr_cap);
            async move {
                if let Some(pipe) = stderr_pipe {
                    collect_capped(pipe, &cap, max_lines, max_bytes).await;
                }
            }
        });

        let (exit_code, timed_out) = match tokio::time::timeout(limits.timeout, child.wait()).await
        {
            // Returns -1 if killed by signal (SIGKILL, SIGSEGV, etc.)
            Ok(status) => (status?.code().unwrap_or(-1), false),
            Err(_) => {
                debug!(cmd = cmd, timeout = ?limits.timeout, "Execution timed out, killing process");
                // The process may have exited between the deadline and here.
                let _ = child.start_kill();
                let _ = child.wait().await;
                (-1, true)
            }
        };

        // The child is gone, but descendants it left behind may still hold
        // the pipe write ends open. Give the collectors a bounded grace to
        // pick up the remaining output, then abandon them.
        let drain = async {
            let _ = (&mut stdout_task).await;
            let _ = (&mut stderr_task).await;
        };
        let drain_cut = tokio::time::timeout(DRAIN_GRACE, drain).await.is_err();
        if drain_cut {
            debug!(cmd = cmd, "Pipes still open past the drain grace, abandoning collectors");
            stdout_task.abort();
            stderr_task.abort();
        }

        let (stdout, stdout_truncated) = stdout_cap.take();
        let (stderr, stderr_truncated) = stderr_cap.take();

        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
            truncated: stdout_truncated || stderr_truncated || timed_out || drain_cut,
            timed_out,
            duration: started.elapsed(),
        })
    }

    fn mode(&self) -> &'static str {
        "subprocess"
    }
}

/// Scrub the child environment to the baseline plus the explicit allowlist.
///
/// HOME is bound to the workspace so dotfile writes stay inside the session.
fn scrub_env(command: &mut Command, workspace: &Path, allowlist: &[String]) {
    command.env_clear();
    for key in BASELINE_ENV {
        if let Ok(value) = std::env::var(key) {
            command.env(key, value);
        }
    }
    command.env("HOME", workspace);
    for key in allowlist {
        if let Ok(value) = std::env::var(key) {
            command.env(key, value);
        }
    }
}

/// Capture buffer shared between a collector task and the caller.
///
/// The caller reads it after the collector finishes or is abandoned, so
/// lines are committed under a brief lock rather than returned at the end.
#[derive(Default)]
struct Capture {
    buf: Mutex<String>,
    truncated: AtomicBool,
}

impl Capture {
    fn take(&self) -> (String, bool) {
        let text = match self.buf.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        (text, self.truncated.load(Ordering::Acquire))
    }
}

/// Collect a stream line by line into `capture`, up to the ceilings.
///
/// Once either ceiling is hit the remaining output is discarded but the
/// stream keeps draining: truncation is a reporting policy, not a
/// cancellation trigger.
async fn collect_capped<R: AsyncRead + Unpin>(
    reader: R,
    capture: &Capture,
    max_lines: usize,
    max_bytes: usize,
) {
    let mut lines = BufReader::new(reader).lines();
    let mut count = 0usize;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let mut out = match capture.buf.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if count < max_lines && out.len() + line.len() < max_bytes {
                    out.push_str(&line);
                    out.push('\n');
                    count += 1;
                } else {
                    capture.truncated.store(true, Ordering::Release);
                }
            }
            // End of stream, or undecodable bytes / broken pipe: keep what
            // was captured so far.
            Ok(None) | Err(_) => break,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
