//! Gateway configuration loading.
//!
//! Configuration is an immutable snapshot: it is loaded (or reloaded) as a
//! whole and shared read-only behind an `Arc`. In-flight executions never
//! observe a partially updated policy.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

// ============================================================================
// GatewayConfig
// ============================================================================

/// Process-wide configuration for the execution gateway.
///
/// Covers execution limits, feature toggles, security blocklists, and
/// session lifecycle knobs. All fields have defaults, so an empty (or
/// missing) config file yields a working configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Root directory for per-session workspaces.
    pub workspace_root: Option<PathBuf>,

    /// Python interpreter used for code execution and pip installs.
    pub python_cmd: String,

    // ------------------------------------------------------------------------
    // Execution limits
    // ------------------------------------------------------------------------
    /// Wall-clock ceiling for a single execution, in seconds.
    pub timeout_secs: u64,
    /// Maximum captured output lines per stream; excess is discarded and
    /// flagged truncated.
    pub max_output_lines: usize,
    /// Maximum captured output bytes per stream.
    pub max_output_bytes: usize,
    /// Per-file size ceiling for workspace writes, in bytes.
    pub max_file_size_bytes: u64,
    /// Maximum number of files a single session may hold.
    pub max_files_per_session: usize,

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------
    /// Maximum number of live sessions; creating one past the cap evicts the
    /// idlest unlocked session.
    pub max_sessions: usize,
    /// Idle time after which a session is eligible for the expiry sweep,
    /// in seconds.
    pub session_idle_secs: u64,

    // ------------------------------------------------------------------------
    // Feature toggles
    // ------------------------------------------------------------------------
    /// Enable the shell execution operation.
    pub allow_shell: bool,
    /// Enable package installation via pip.
    pub allow_pip_install: bool,
    /// Enable workspace file write operations.
    pub allow_file_persistence: bool,

    // ------------------------------------------------------------------------
    // Security blocklists
    // ------------------------------------------------------------------------
    /// Python module names denied at the top-level import position
    /// (case-sensitive exact match).
    pub blocked_imports: Vec<String>,
    /// Substrings denied in shell commands after whitespace normalization
    /// (case-sensitive).
    pub blocked_shell_patterns: Vec<String>,
    /// Environment variables copied from the parent process into sandboxed
    /// executions, in addition to the baseline (PATH, LANG, TZ).
    pub env_allowlist: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            python_cmd: "python3".to_string(),
            timeout_secs: 30,
            max_output_lines: 150,
            max_output_bytes: 50_000,
            max_file_size_bytes: 10 * 1024 * 1024,
            max_files_per_session: 50,
            max_sessions: 10,
            session_idle_secs: 1800,
            allow_shell: true,
            allow_pip_install: true,
            allow_file_persistence: true,
            blocked_imports: to_strings(&["subprocess", "multiprocessing", "ctypes", "_thread"]),
            blocked_shell_patterns: to_strings(&[
                "rm -rf /",
                "mkfs.",
                "dd if=",
                ":(){",
                "chmod -R 777 /",
                "> /dev/sd",
            ]),
            env_allowlist: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference '${{' (missing '}}')")]
    UnclosedVarReference,
}

impl GatewayConfig {
    /// Load configuration from a YAML file.
    ///
    /// A missing file yields the default configuration; any other I/O or
    /// parse failure is fatal to the load (callers fail fast at startup).
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let expanded = expand_env_vars(&contents)?;
        Ok(serde_yaml::from_str(&expanded)?)
    }

    /// Wall-clock execution budget.
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Budget for pip installs: double the exec budget, at least one minute.
    pub fn pip_timeout(&self) -> Duration {
        Duration::from_secs((self.timeout_secs * 2).max(60))
    }

    /// Idle threshold for the expiry sweep.
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

/// Resolve a path relative to the config file directory.
///
/// Absolute paths are returned as-is; relative paths are joined with the
/// config file's parent directory so behavior does not depend on the current
/// working directory.
pub fn resolve_path(config_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }

    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    config_dir.join(path)
}

// ============================================================================
// Defaults
// ============================================================================

/// Default workspace root (relative to the config file).
pub const DEFAULT_WORKSPACE_ROOT: &str = ".toolgate/workspaces";

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand `${VAR}` and `${VAR:-default}` references in config text.
///
/// `$$` escapes a literal `$`. A `$` not followed by `{` is kept verbatim.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                result.push('$');
            }
            Some('{') => {
                chars.next();
                result.push_str(&resolve_var(&mut chars)?);
            }
            _ => result.push('$'),
        }
    }

    Ok(result)
}

/// Resolve the `NAME` or `NAME:-default` body of a `${...}` reference.
fn resolve_var(chars: &mut std::iter::Peekable<std::str::Chars>) -> Result<String, ConfigError> {
    let mut body = String::new();
    loop {
        match chars.next() {
            Some('}') => break,
            Some(c) => body.push(c),
            None => return Err(ConfigError::UnclosedVarReference),
        }
    }

    let (name, default) = match body.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (body.as_str(), None),
    };

    match std::env::var(name) {
        Ok(value) => Ok(value),
        Err(_) => default
            .map(str::to_string)
            .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string())),
    }
}

// ============================================================================
// Tests
// ============================================================================
