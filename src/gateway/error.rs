//! Error taxonomy for gateway operations.
//!
//! Everything here is recoverable and reported to the caller; nothing
//! propagates as an uncaught fault out of the facade.

use thiserror::Error;

use crate::sandbox::SandboxError;
use crate::session::SessionError;
use crate::workspace::WorkspaceError;

use super::{Envelope, ExecStatus};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<SessionError> for GatewayError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Workspace(w) => Self::Workspace(w),
        }
    }
}

impl GatewayError {
    /// The envelope status this error maps to.
    ///
    /// Path escapes are rejections (and already logged as notable events),
    /// so they surface as `Blocked`; size ceilings as `LimitExceeded`;
    /// spawn/OS faults, missing files and bad input as `Error`.
    pub fn status(&self) -> ExecStatus {
        match self {
            Self::Workspace(WorkspaceError::PathEscape(_)) => ExecStatus::Blocked,
            Self::Workspace(WorkspaceError::SizeLimitExceeded { .. })
            | Self::Workspace(WorkspaceError::TooManyFiles { .. }) => ExecStatus::LimitExceeded,
            Self::Workspace(_) | Self::Sandbox(_) | Self::InvalidInput(_) | Self::Internal(_) => {
                ExecStatus::Error
            }
        }
    }

    /// Fold this error into the uniform result envelope.
    pub fn into_envelope(self, duration_ms: u64) -> Envelope {
        Envelope {
            status: self.status(),
            stdout: String::new(),
            stderr: self.to_string(),
            truncated: false,
            duration_ms,
        }
    }
}
