//! The execution facade: the single entry point for tool calls.
//!
//! Composes policy evaluation, session management, and the sandbox runner,
//! and normalizes every outcome (success, blocked, timeout, error,
//! limit-exceeded) into one envelope shape so callers never branch on the
//! execution kind. Policy always runs before any session or sandbox
//! involvement; a denied payload costs nothing.

mod error;

pub use error::GatewayError;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::{DEFAULT_WORKSPACE_ROOT, GatewayConfig};
use crate::policy::{self, Decision, ExecKind};
use crate::sandbox::{ExecLimits, ExecResult, Sandbox, SubprocessSandbox};
use crate::session::{ExecutionRecord, SessionInfo, SessionManager};
use crate::workspace::{FileInfo, WorkspaceError, WorkspaceStore};

/// Session identifier used when the caller supplies none. Ordinary in every
/// way, including expiry.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Hard ceiling on execution payloads (code and shell commands). File
/// content is governed by `max_file_size_bytes` instead.
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// Budget for environment probes (interpreter/pip versions).
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Result envelope
// ============================================================================

/// Terminal status of a gateway operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Success,
    Blocked,
    Timeout,
    Error,
    LimitExceeded,
}

/// The uniform result envelope every operation returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: String,
    /// Captured output hit a ceiling, or a timeout cut capture short.
    pub truncated: bool,
    pub duration_ms: u64,
}

impl Envelope {
    /// Build an envelope from sandbox execution output.
    fn from_exec(result: &ExecResult) -> Self {
        let status = if result.timed_out {
            ExecStatus::Timeout
        } else if result.exit_code == 0 {
            ExecStatus::Success
        } else {
            ExecStatus::Error
        };

        let mut stderr = result.stderr.clone();
        if result.timed_out && stderr.is_empty() {
            stderr = format!(
                "execution timed out after {:.1}s",
                result.duration.as_secs_f64()
            );
        } else if status == ExecStatus::Error && stderr.is_empty() {
            stderr = format!("command exited with code {}", result.exit_code);
        }

        Self {
            status,
            stdout: result.stdout.clone(),
            stderr,
            truncated: result.truncated,
            duration_ms: result.duration.as_millis() as u64,
        }
    }

    fn success(stdout: String, truncated: bool) -> Self {
        Self {
            status: ExecStatus::Success,
            stdout,
            stderr: String::new(),
            truncated,
            duration_ms: 0,
        }
    }

    fn blocked(reason: impl Into<String>) -> Self {
        Self {
            status: ExecStatus::Blocked,
            stdout: String::new(),
            stderr: reason.into(),
            truncated: false,
            duration_ms: 0,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: ExecStatus::Error,
            stdout: String::new(),
            stderr: message.into(),
            truncated: false,
            duration_ms: 0,
        }
    }

    fn limit_exceeded(message: impl Into<String>) -> Self {
        Self {
            status: ExecStatus::LimitExceeded,
            stdout: String::new(),
            stderr: message.into(),
            truncated: false,
            duration_ms: 0,
        }
    }

    fn with_duration(mut self, started: Instant) -> Self {
        self.duration_ms = elapsed_ms(started);
        self
    }
}

/// Static process-wide capability report.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentReport {
    pub python_version: Option<String>,
    pub pip_version: Option<String>,
    pub sandbox_mode: String,
    pub shell_enabled: bool,
    pub pip_install_enabled: bool,
    pub file_persistence_enabled: bool,
    pub timeout_secs: u64,
    pub active_sessions: usize,
    pub generated_at: DateTime<Utc>,
}

// ============================================================================
// Gateway
// ============================================================================

/// The tool-execution gateway.
///
/// Holds the configuration snapshot (swapped atomically on reload, never
/// mutated in place), the session manager, and the sandbox backend. Created
/// at process start and passed down explicitly.
pub struct Gateway {
    config: RwLock<Arc<GatewayConfig>>,
    sessions: SessionManager,
    sandbox: Arc<dyn Sandbox>,
}

impl Gateway {
    /// Create a gateway with the subprocess sandbox backend.
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_sandbox(config, Arc::new(SubprocessSandbox::new()))
    }

    /// Create a gateway with a custom sandbox backend.
    pub fn with_sandbox(config: GatewayConfig, sandbox: Arc<dyn Sandbox>) -> Self {
        let root = config
            .workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE_ROOT));
        Self {
            config: RwLock::new(Arc::new(config)),
            sessions: SessionManager::new(WorkspaceStore::new(root)),
            sandbox,
        }
    }

    /// Current configuration snapshot.
    pub async fn config(&self) -> Arc<GatewayConfig> {
        self.config.read().await.clone()
    }

    /// Atomically replace the configuration snapshot.
    ///
    /// In-flight executions keep the snapshot they started with.
    pub async fn reload_config(&self, config: GatewayConfig) {
        *self.config.write().await = Arc::new(config);
        info!("Reloaded gateway configuration");
    }

    /// Sessions currently live.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // ------------------------------------------------------------------------
    // Execution operations
    // ------------------------------------------------------------------------

    /// Execute Python source in the session's workspace.
    ///
    /// Imports are statically scanned against the blocklist before anything
    /// is written or spawned. Dynamically constructed imports are not
    /// detected; see [`crate::policy`].
    pub async fn run_code(&self, session_id: Option<&str>, source: &str) -> Envelope {
        let started = Instant::now();
        let cfg = self.config().await;

        if let Some(envelope) = validate_payload(source, "code") {
            return envelope.with_duration(started);
        }
        if let Decision::Deny { reason } = policy::evaluate(ExecKind::Python, source, &cfg) {
            debug!(reason = %reason, "Blocked code execution");
            return Envelope::blocked(reason).with_duration(started);
        }

        let source = source.to_string();
        let sandbox = Arc::clone(&self.sandbox);
        let cfg2 = Arc::clone(&cfg);
        let outcome = self
            .sessions
            .with_session(resolve_id(session_id), cfg.max_sessions, move |session| {
                async move {
                    let script = format!("script_{}.py", session.execution_count + 1);
                    let script_path = session.workspace.join(&script);
                    let envelope = match tokio::fs::write(&script_path, &source).await {
                        Err(e) => GatewayError::from(WorkspaceError::io(&script_path, e))
                            .into_envelope(elapsed_ms(started)),
                        Ok(()) => {
                            let limits = ExecLimits::from_config(&cfg2);
                            let outcome = sandbox
                                .exec(&cfg2.python_cmd, &[script], &session.workspace, &limits)
                                .await;
                            // The script is transient; it must not linger in
                            // listings or count against the file ceiling.
                            let _ = tokio::fs::remove_file(&script_path).await;
                            match outcome {
                                Ok(result) => Envelope::from_exec(&result),
                                Err(e) => {
                                    GatewayError::from(e).into_envelope(elapsed_ms(started))
                                }
                            }
                        }
                    };
                    let envelope = envelope.with_duration(started);
                    session.record(ExecutionRecord::new(
                        "run_code",
                        &source,
                        envelope.status,
                        envelope.truncated,
                        envelope.duration_ms,
                    ));
                    envelope
                }
                .boxed()
            })
            .await;

        unwrap_outcome(outcome, started)
    }

    /// Execute a shell command in the session's workspace.
    pub async fn run_shell(&self, session_id: Option<&str>, command: &str) -> Envelope {
        let started = Instant::now();
        let cfg = self.config().await;

        if !cfg.allow_shell {
            return Envelope::blocked("feature disabled: shell execution").with_duration(started);
        }
        if let Some(envelope) = validate_payload(command, "command") {
            return envelope.with_duration(started);
        }
        if let Decision::Deny { reason } = policy::evaluate(ExecKind::Shell, command, &cfg) {
            debug!(reason = %reason, "Blocked shell execution");
            return Envelope::blocked(reason).with_duration(started);
        }

        let command = command.to_string();
        let sandbox = Arc::clone(&self.sandbox);
        let cfg2 = Arc::clone(&cfg);
        let outcome = self
            .sessions
            .with_session(resolve_id(session_id), cfg.max_sessions, move |session| {
                async move {
                    let limits = ExecLimits::from_config(&cfg2);
                    let args = vec!["-c".to_string(), command.clone()];
                    let envelope = match sandbox
                        .exec("sh", &args, &session.workspace, &limits)
                        .await
                    {
                        Ok(result) => Envelope::from_exec(&result),
                        Err(e) => GatewayError::from(e).into_envelope(elapsed_ms(started)),
                    }
                    .with_duration(started);
                    session.record(ExecutionRecord::new(
                        "run_shell",
                        &command,
                        envelope.status,
                        envelope.truncated,
                        envelope.duration_ms,
                    ));
                    envelope
                }
                .boxed()
            })
            .await;

        unwrap_outcome(outcome, started)
    }

    /// Install Python packages with pip.
    ///
    /// A fixed command template with its own allow/deny gate, independent of
    /// import scanning. Package names are validated against a conservative
    /// charset before anything runs.
    pub async fn install_packages(&self, session_id: Option<&str>, packages: &str) -> Envelope {
        let started = Instant::now();
        let cfg = self.config().await;

        if !cfg.allow_pip_install {
            return Envelope::blocked("feature disabled: package installation")
                .with_duration(started);
        }

        let names: Vec<String> = packages
            .split([',', ' ', '\t', '\n'])
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if names.is_empty() {
            return Envelope::error("no packages specified").with_duration(started);
        }
        let invalid: Vec<&str> = names
            .iter()
            .filter(|n| !is_valid_package_name(n))
            .map(|n| n.as_str())
            .collect();
        if !invalid.is_empty() {
            return Envelope::error(format!("invalid package names: {}", invalid.join(", ")))
                .with_duration(started);
        }

        let sandbox = Arc::clone(&self.sandbox);
        let cfg2 = Arc::clone(&cfg);
        let input = names.join(" ");
        let outcome = self
            .sessions
            .with_session(resolve_id(session_id), cfg.max_sessions, move |session| {
                async move {
                    let mut args: Vec<String> = ["-m", "pip", "install", "--user", "--quiet"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect();
                    args.extend(names);

                    let limits =
                        ExecLimits::from_config(&cfg2).with_timeout(cfg2.pip_timeout());
                    let envelope = match sandbox
                        .exec(&cfg2.python_cmd, &args, &session.workspace, &limits)
                        .await
                    {
                        Ok(result) => Envelope::from_exec(&result),
                        Err(e) => GatewayError::from(e).into_envelope(elapsed_ms(started)),
                    }
                    .with_duration(started);
                    session.record(ExecutionRecord::new(
                        "install_packages",
                        &input,
                        envelope.status,
                        envelope.truncated,
                        envelope.duration_ms,
                    ));
                    envelope
                }
                .boxed()
            })
            .await;

        unwrap_outcome(outcome, started)
    }

    // ------------------------------------------------------------------------
    // File operations
    // ------------------------------------------------------------------------

    /// Write a file into the session workspace.
    pub async fn write_file(
        &self,
        session_id: Option<&str>,
        filename: &str,
        content: &str,
    ) -> Envelope {
        let started = Instant::now();
        let cfg = self.config().await;

        if !cfg.allow_file_persistence {
            return Envelope::blocked("feature disabled: file persistence").with_duration(started);
        }
        if filename.is_empty() {
            return Envelope::error("no filename provided").with_duration(started);
        }

        let store = self.sessions.store().clone();
        let filename = filename.to_string();
        let content = content.to_string();
        let cfg2 = Arc::clone(&cfg);
        let outcome = self
            .sessions
            .with_session(resolve_id(session_id), cfg.max_sessions, move |session| {
                async move {
                    match store
                        .write_file(
                            &session.id,
                            &filename,
                            &content,
                            cfg2.max_file_size_bytes,
                            cfg2.max_files_per_session,
                        )
                        .await
                    {
                        Ok(info) => Envelope::success(
                            format!("wrote {} ({} bytes)", info.name, info.size),
                            false,
                        ),
                        Err(e) => GatewayError::from(e).into_envelope(0),
                    }
                    .with_duration(started)
                }
                .boxed()
            })
            .await;

        unwrap_outcome(outcome, started)
    }

    /// Read a file from the session workspace.
    ///
    /// Content is returned in `stdout`, subject to the output ceilings.
    pub async fn read_file(&self, session_id: Option<&str>, filename: &str) -> Envelope {
        let started = Instant::now();
        let cfg = self.config().await;

        if filename.is_empty() {
            return Envelope::error("no filename provided").with_duration(started);
        }

        let store = self.sessions.store().clone();
        let filename = filename.to_string();
        let cfg2 = Arc::clone(&cfg);
        let outcome = self
            .sessions
            .with_session(resolve_id(session_id), cfg.max_sessions, move |session| {
                async move {
                    match store.read_file(&session.id, &filename).await {
                        Ok(content) => {
                            let (content, truncated) = truncate_text(
                                &content,
                                cfg2.max_output_lines,
                                cfg2.max_output_bytes,
                            );
                            Envelope::success(content, truncated)
                        }
                        Err(WorkspaceError::NotFound(_)) => {
                            let available = store
                                .list_files(&session.id)
                                .await
                                .map(|files| {
                                    files
                                        .iter()
                                        .map(|f| f.name.clone())
                                        .collect::<Vec<_>>()
                                        .join(", ")
                                })
                                .unwrap_or_default();
                            Envelope::error(format!(
                                "file not found: {filename} (available: {})",
                                if available.is_empty() {
                                    "none"
                                } else {
                                    available.as_str()
                                }
                            ))
                        }
                        Err(e) => GatewayError::from(e).into_envelope(0),
                    }
                    .with_duration(started)
                }
                .boxed()
            })
            .await;

        unwrap_outcome(outcome, started)
    }

    /// List the files in the session workspace.
    pub async fn list_files(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<FileInfo>, GatewayError> {
        let cfg = self.config().await;
        let store = self.sessions.store().clone();
        let files = self
            .sessions
            .with_session(resolve_id(session_id), cfg.max_sessions, move |session| {
                async move { store.list_files(&session.id).await }.boxed()
            })
            .await
            .map_err(GatewayError::from)??;
        Ok(files)
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    /// Session metadata: creation time, last activity, execution count.
    pub async fn session_info(
        &self,
        session_id: Option<&str>,
    ) -> Result<SessionInfo, GatewayError> {
        let cfg = self.config().await;
        let store = self.sessions.store().clone();
        let info = self
            .sessions
            .with_session(resolve_id(session_id), cfg.max_sessions, move |session| {
                async move {
                    let file_count = store
                        .list_files(&session.id)
                        .await
                        .map(|files| files.len())
                        .unwrap_or(0);
                    SessionInfo {
                        session_id: session.id.clone(),
                        created_at: session.created_at,
                        last_active: session.last_active,
                        execution_count: session.execution_count,
                        file_count,
                    }
                }
                .boxed()
            })
            .await?;
        Ok(info)
    }

    /// Ordered execution history for a session, oldest first.
    ///
    /// Read-only: never creates a session.
    pub async fn history(&self, session_id: Option<&str>) -> Option<Vec<ExecutionRecord>> {
        self.sessions.history(resolve_id(session_id)).await
    }

    /// Static process-wide capability report; involves no session.
    pub async fn environment_info(&self) -> EnvironmentReport {
        let cfg = self.config().await;
        let root = self.sessions.store().root().to_path_buf();
        let _ = tokio::fs::create_dir_all(&root).await;

        let limits = ExecLimits::from_config(&cfg).with_timeout(PROBE_TIMEOUT);
        let python_version = self.probe(&cfg.python_cmd, &["--version"], &root, &limits).await;
        let pip_version = self
            .probe(&cfg.python_cmd, &["-m", "pip", "--version"], &root, &limits)
            .await;

        EnvironmentReport {
            python_version,
            pip_version,
            sandbox_mode: self.sandbox.mode().to_string(),
            shell_enabled: cfg.allow_shell,
            pip_install_enabled: cfg.allow_pip_install,
            file_persistence_enabled: cfg.allow_file_persistence,
            timeout_secs: cfg.timeout_secs,
            active_sessions: self.sessions.len(),
            generated_at: Utc::now(),
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Tear down every session idle beyond the configured threshold.
    pub async fn sweep_expired(&self) -> usize {
        let threshold = self.config().await.idle_threshold();
        self.sessions.sweep_expired(threshold).await
    }

    /// Spawn a background task sweeping expired sessions at `interval`,
    /// using the idle threshold configured at spawn time.
    pub async fn spawn_sweep_task(&self, interval: Duration) {
        let threshold = self.config().await.idle_threshold();
        self.sessions.clone().spawn_sweep_task(interval, threshold);
    }

    async fn probe(
        &self,
        cmd: &str,
        args: &[&str],
        cwd: &std::path::Path,
        limits: &ExecLimits,
    ) -> Option<String> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        match self.sandbox.exec(cmd, &args, cwd, limits).await {
            Ok(result) if result.exit_code == 0 => {
                // Some interpreters print version banners to stderr.
                let text = if result.stdout.trim().is_empty() {
                    result.stderr
                } else {
                    result.stdout
                };
                text.lines().next().map(|l| l.trim().to_string())
            }
            _ => None,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn resolve_id(session_id: Option<&str>) -> &str {
    match session_id {
        Some(id) if !id.is_empty() => id,
        _ => DEFAULT_SESSION_ID,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn unwrap_outcome(
    outcome: Result<Envelope, crate::session::SessionError>,
    started: Instant,
) -> Envelope {
    match outcome {
        Ok(envelope) => envelope,
        Err(e) => GatewayError::from(e).into_envelope(elapsed_ms(started)),
    }
}

/// Validate payload shape: non-empty, within the hard request ceiling.
fn validate_payload(payload: &str, what: &str) -> Option<Envelope> {
    if payload.trim().is_empty() {
        return Some(Envelope::error(format!("no {what} provided")));
    }
    if payload.len() > MAX_REQUEST_BYTES {
        return Some(Envelope::limit_exceeded(format!(
            "request exceeds {MAX_REQUEST_BYTES} bytes"
        )));
    }
    None
}

/// Cap text at the byte ceiling, then the line ceiling.
fn truncate_text(text: &str, max_lines: usize, max_bytes: usize) -> (String, bool) {
    let mut body = text;
    let mut truncated = false;

    if body.len() > max_bytes {
        let mut end = max_bytes;
        while end > 0 && !body.is_char_boundary(end) {
            end -= 1;
        }
        body = &body[..end];
        truncated = true;
    }

    let lines: Vec<&str> = body.lines().collect();
    if lines.len() > max_lines {
        (lines[..max_lines].join("\n"), true)
    } else {
        (body.to_string(), truncated)
    }
}

/// Package names may carry extras and version constraints, nothing else.
fn is_valid_package_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-[]<>=!.".contains(c))
}

// ============================================================================
// Tests
// ============================================================================
