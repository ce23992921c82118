//! Session state and lifecycle.
//!
//! A session is the unit of isolation and mutual exclusion: one workspace
//! directory, one execution history, one lock. Sessions are created on first
//! reference, refreshed on every operation, and torn down by the expiry
//! sweep or explicit removal.

mod manager;

pub use manager::{SessionError, SessionManager};

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::gateway::ExecStatus;

/// History entries kept per session; older entries are dropped.
pub const MAX_HISTORY: usize = 50;

/// Input characters kept in an execution record.
pub const MAX_RECORD_INPUT: usize = 200;

/// One completed operation in a session's history.
///
/// Immutable once appended; owned exclusively by its session.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    /// Tool kind invoked (e.g. "run_code", "run_shell").
    pub kind: String,
    /// Input payload, truncated to [`MAX_RECORD_INPUT`] characters.
    pub input: String,
    /// Envelope status the operation produced.
    pub status: ExecStatus,
    /// Whether the captured output was truncated.
    pub truncated: bool,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// When the operation completed.
    pub at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Build a record, truncating the input for storage.
    pub fn new(kind: &str, input: &str, status: ExecStatus, truncated: bool, duration_ms: u64) -> Self {
        let input = match input.char_indices().nth(MAX_RECORD_INPUT) {
            Some((idx, _)) => input[..idx].to_string(),
            None => input.to_string(),
        };
        Self {
            kind: kind.to_string(),
            input,
            status,
            truncated,
            duration_ms,
            at: Utc::now(),
        }
    }
}

/// Read-only session introspection snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub execution_count: u64,
    pub file_count: usize,
}

/// A live session: workspace binding, history, and activity timestamps.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    /// Workspace directory owned by this session.
    pub workspace: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub execution_count: u64,
    history: Vec<ExecutionRecord>,
    /// Tombstone: cleared by teardown so late lock acquirers know to retry
    /// against a fresh session instead of a removed workspace.
    pub(crate) live: bool,
}

impl Session {
    pub(crate) fn new(id: &str, workspace: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            workspace,
            created_at: now,
            last_active: now,
            execution_count: 0,
            history: Vec::new(),
            live: true,
        }
    }

    /// Append an execution record, bumping the execution count and capping
    /// history at [`MAX_HISTORY`] entries.
    pub fn record(&mut self, record: ExecutionRecord) {
        self.execution_count += 1;
        self.history.push(record);
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
    }

    /// Ordered execution history, oldest first.
    pub fn history(&self) -> &[ExecutionRecord] {
        &self.history
    }
}

// ============================================================================
// Tests
// ============================================================================
