//! Error types for workspace filesystem operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during workspace operations.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// A file name resolved outside the workspace root.
    #[error("path '{0}' escapes the workspace root")]
    PathEscape(String),

    /// A write exceeded the per-file size ceiling.
    #[error("file '{name}' exceeds the size limit ({size} > {limit} bytes)")]
    SizeLimitExceeded { name: String, size: u64, limit: u64 },

    /// The session reached its file-count ceiling.
    #[error("session file limit reached ({limit} files)")]
    TooManyFiles { limit: usize },

    /// The requested file does not exist in the workspace.
    #[error("file not found: {0}")]
    NotFound(String),

    /// I/O error with path context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
