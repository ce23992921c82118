//! Session table and per-session serialization.
//!
//! The manager owns the mapping from session identifier to session state.
//! Table mutations (create, lookup, sweep) hold only brief table-level locks;
//! the long-running execution is guarded by the per-session mutex, so
//! different sessions proceed fully in parallel while operations on one
//! session are strictly serialized.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::workspace::{WorkspaceError, WorkspaceStore};

use super::{ExecutionRecord, Session};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

/// Owns all known sessions and enforces single-writer-per-session discipline.
///
/// Explicitly constructed and passed down; there is no ambient singleton.
/// Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    table: Arc<DashMap<String, Arc<Mutex<Session>>>>,
    store: WorkspaceStore,
}

impl SessionManager {
    pub fn new(store: WorkspaceStore) -> Self {
        Self {
            table: Arc::new(DashMap::new()),
            store,
        }
    }

    /// The workspace store backing this manager.
    pub fn store(&self) -> &WorkspaceStore {
        &self.store
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Run an operation with exclusive access to a session.
    ///
    /// Resolves or creates the session (evicting the idlest unlocked session
    /// if `max_sessions` is reached), acquires its lock, refreshes the
    /// activity timestamp, and runs `op`. Operations against the same
    /// identifier are admitted in lock-acquisition order; different
    /// identifiers never contend.
    pub async fn with_session<T>(
        &self,
        session_id: &str,
        max_sessions: usize,
        op: impl for<'a> FnOnce(&'a mut Session) -> BoxFuture<'a, T> + Send,
    ) -> Result<T, SessionError> {
        let mut guard = loop {
            let cell = self.entry(session_id, max_sessions).await?;
            let guard = cell.lock_owned().await;
            if guard.live {
                break guard;
            }
            // Torn down between lookup and lock acquisition; retry against a
            // fresh session.
        };

        guard.last_active = Utc::now();
        let result = op(&mut guard).await;
        guard.last_active = Utc::now();
        Ok(result)
    }

    /// Ordered history snapshot for a session, oldest first.
    ///
    /// Takes the session lock only for the copy; returns `None` for unknown
    /// sessions (introspection never creates one).
    pub async fn history(&self, session_id: &str) -> Option<Vec<ExecutionRecord>> {
        let cell = self.table.get(session_id)?.clone();
        let guard = cell.lock().await;
        Some(guard.history().to_vec())
    }

    /// Tear down every session idle for longer than `idle_threshold`.
    ///
    /// Non-blocking per session: a held lock (execution in progress) or a
    /// pending waiter means the session is skipped this sweep; active work
    /// is never interrupted. Returns the number of sessions removed.
    pub async fn sweep_expired(&self, idle_threshold: Duration) -> usize {
        let threshold = chrono::Duration::from_std(idle_threshold)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let now = Utc::now();

        let candidates: Vec<(String, Arc<Mutex<Session>>)> = self
            .table
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut removed = 0;
        for (id, cell) in candidates {
            // Two strong references are ours (table + candidate list); more
            // means someone is waiting on this session.
            if Arc::strong_count(&cell) > 2 {
                continue;
            }
            let Ok(mut guard) = cell.try_lock() else {
                continue;
            };
            if !guard.live || now - guard.last_active < threshold {
                continue;
            }
            self.destroy(&id, &mut guard).await;
            removed += 1;
        }

        if removed > 0 {
            debug!(
                removed = removed,
                remaining = self.table.len(),
                "Swept expired sessions"
            );
        }
        removed
    }

    /// Spawn a background task that sweeps expired sessions periodically.
    ///
    /// Runs until the runtime shuts down.
    pub fn spawn_sweep_task(self, interval: Duration, idle_threshold: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_expired(idle_threshold).await;
            }
        });
    }

    /// Explicitly tear down a session if it is not busy.
    ///
    /// Returns true if the session was removed.
    pub async fn remove(&self, session_id: &str) -> bool {
        let Some(cell) = self.table.get(session_id).map(|e| e.value().clone()) else {
            return false;
        };
        let Ok(mut guard) = cell.try_lock() else {
            return false;
        };
        if !guard.live {
            return false;
        }
        self.destroy(session_id, &mut guard).await;
        true
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Look up or create the session cell for an identifier.
    ///
    /// The workspace directory is created before the session becomes visible
    /// in the table, so a session's directory exists iff the session does.
    async fn entry(
        &self,
        session_id: &str,
        max_sessions: usize,
    ) -> Result<Arc<Mutex<Session>>, SessionError> {
        if let Some(cell) = self.table.get(session_id) {
            return Ok(cell.value().clone());
        }

        if max_sessions > 0 && self.table.len() >= max_sessions {
            self.evict_idlest().await;
        }

        let workspace = self.store.resolve(session_id).await?;
        let cell = self
            .table
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(session_id, workspace))))
            .value()
            .clone();
        Ok(cell)
    }

    /// Evict the least recently active session whose lock is free.
    async fn evict_idlest(&self) {
        let mut candidate: Option<(String, Arc<Mutex<Session>>)> = None;
        let mut oldest = Utc::now();

        for entry in self.table.iter() {
            let cell = entry.value().clone();
            let Ok(guard) = cell.try_lock() else {
                continue;
            };
            if guard.last_active <= oldest {
                oldest = guard.last_active;
                candidate = Some((entry.key().clone(), cell.clone()));
            }
        }

        if let Some((id, cell)) = candidate {
            let Ok(mut guard) = cell.try_lock() else {
                return;
            };
            if guard.live {
                debug!(session_id = %id, "Evicting idlest session at capacity");
                self.destroy(&id, &mut guard).await;
            }
        }
    }

    /// Remove a session's workspace and drop it from the table.
    ///
    /// Caller holds the session lock. The workspace is deleted before the
    /// table entry so no window exists where a listed session lacks its
    /// directory.
    async fn destroy(&self, session_id: &str, session: &mut Session) {
        if let Err(e) = self.store.remove(session_id).await {
            warn!(session_id = session_id, error = %e, "Failed to remove workspace during teardown");
        }
        session.live = false;
        self.table.remove(session_id);
    }
}

// ============================================================================
// Tests
// ============================================================================
