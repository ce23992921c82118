//! Sandboxed execution of interpreter and shell subprocesses.
//!
//! The [`Sandbox`] trait is the isolation capability boundary: callers hand it
//! a command, a workspace directory and limits, and get back captured output.
//! A stronger backend (container, microVM) can be substituted without touching
//! policy or session management.

mod error;
mod subprocess;

pub use error::SandboxError;
pub use subprocess::SubprocessSandbox;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::GatewayConfig;

/// Limits applied to a single execution.
#[derive(Debug, Clone)]
pub struct ExecLimits {
    /// Wall-clock ceiling; the process is killed when it is exceeded.
    pub timeout: Duration,
    /// Captured line ceiling per stream; excess is discarded and flagged.
    pub max_output_lines: usize,
    /// Captured byte ceiling per stream.
    pub max_output_bytes: usize,
    /// Extra environment variables forwarded from the parent process.
    pub env_allowlist: Vec<String>,
}

impl ExecLimits {
    /// Derive limits from the gateway configuration.
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            timeout: config.exec_timeout(),
            max_output_lines: config.max_output_lines,
            max_output_bytes: config.max_output_bytes,
            env_allowlist: config.env_allowlist.clone(),
        }
    }

    /// Replace the wall-clock budget (pip installs and version probes use
    /// their own budgets).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Captured outcome of a sandboxed execution.
///
/// Always produced when the process could be spawned, including on timeout;
/// spawn failures surface as [`SandboxError`] instead.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Process exit code; -1 when killed by a signal or by the timeout.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Output hit the line/byte ceiling, or capture was cut short by the
    /// timeout or the bounded post-exit drain.
    pub truncated: bool,
    /// The wall-clock budget was exceeded and the process was killed.
    pub timed_out: bool,
    /// Wall-clock duration of the execution.
    pub duration: Duration,
}

/// Isolated execution context for tool payloads.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Execute a command with the working directory bound to `workspace`,
    /// a scrubbed environment, and the given limits.
    async fn exec(
        &self,
        cmd: &str,
        args: &[String],
        workspace: &Path,
        limits: &ExecLimits,
    ) -> Result<ExecResult, SandboxError>;

    /// Get the sandbox backend name.
    fn mode(&self) -> &'static str;
}
