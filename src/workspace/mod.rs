//! Per-session workspace directories.
//!
//! Pure filesystem lifecycle: one directory per session identifier under a
//! root area, with path containment and size-capped atomic writes. No policy
//! decisions live here.

mod error;

pub use error::WorkspaceError;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::warn;

/// Descriptor for a file in a session workspace.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Prefix for in-progress atomic writes; such entries are never listed.
const TMP_PREFIX: &str = ".tmp-";

/// Store managing per-session working directories on persistent storage.
///
/// Directory names are a collision-free encoding of the session identifier,
/// so any identifier is safe to use. Exactly one directory exists per
/// identifier; [`WorkspaceStore::resolve`] is idempotent.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    /// Create a store rooted at `root`. The directory is created lazily on
    /// first resolve.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory under which session workspaces live.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the workspace directory for a session, creating it on first
    /// call. Idempotent: later calls return the same directory.
    pub async fn resolve(&self, session_id: &str) -> Result<PathBuf, WorkspaceError> {
        let dir = self.session_dir(session_id)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| WorkspaceError::io(&dir, e))?;
        Ok(dir)
    }

    /// Recursively delete a session's workspace. Idempotent: a missing
    /// directory is not an error.
    pub async fn remove(&self, session_id: &str) -> Result<(), WorkspaceError> {
        let dir = self.session_dir(session_id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkspaceError::io(&dir, e)),
        }
    }

    /// Write a file into the session workspace.
    ///
    /// The write is atomic: content lands in a temporary file that is renamed
    /// into place, so a failed or oversized write leaves no partial file.
    pub async fn write_file(
        &self,
        session_id: &str,
        name: &str,
        content: &str,
        max_file_size_bytes: u64,
        max_files: usize,
    ) -> Result<FileInfo, WorkspaceError> {
        let dir = self.resolve(session_id).await?;
        let path = member_path(&dir, name)?;

        let size = content.len() as u64;
        if size > max_file_size_bytes {
            return Err(WorkspaceError::SizeLimitExceeded {
                name: name.to_string(),
                size,
                limit: max_file_size_bytes,
            });
        }

        // The ceiling counts distinct files; overwriting an existing one is
        // always allowed.
        if !fs::try_exists(&path)
            .await
            .map_err(|e| WorkspaceError::io(&path, e))?
            && self.file_count(&dir).await? >= max_files
        {
            return Err(WorkspaceError::TooManyFiles { limit: max_files });
        }

        let tmp = dir.join(format!("{TMP_PREFIX}{name}"));
        fs::write(&tmp, content)
            .await
            .map_err(|e| WorkspaceError::io(&tmp, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| WorkspaceError::io(&path, e))?;

        Ok(FileInfo {
            name: name.to_string(),
            size,
            modified: Utc::now(),
        })
    }

    /// Read a file from the session workspace.
    pub async fn read_file(&self, session_id: &str, name: &str) -> Result<String, WorkspaceError> {
        let dir = self.session_dir(session_id)?;
        let path = member_path(&dir, name)?;
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(WorkspaceError::NotFound(name.to_string()))
            }
            Err(e) => Err(WorkspaceError::io(&path, e)),
        }
    }

    /// List the files in a session workspace, sorted by name.
    ///
    /// Executions may create files directly, so this reads the directory
    /// rather than any bookkeeping.
    pub async fn list_files(&self, session_id: &str) -> Result<Vec<FileInfo>, WorkspaceError> {
        let dir = self.session_dir(session_id)?;

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WorkspaceError::io(&dir, e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorkspaceError::io(&dir, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TMP_PREFIX) {
                continue;
            }
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| WorkspaceError::io(entry.path(), e))?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            files.push(FileInfo {
                name,
                size: metadata.len(),
                modified,
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, WorkspaceError> {
        if session_id.is_empty() {
            return Err(WorkspaceError::PathEscape(String::new()));
        }
        Ok(self.root.join(encode_session_id(session_id)))
    }

    async fn file_count(&self, dir: &Path) -> Result<usize, WorkspaceError> {
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|e| WorkspaceError::io(dir, e))?;
        let mut count = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorkspaceError::io(dir, e))?
        {
            if !entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Encode a session identifier into a collision-free directory name.
///
/// Bytes in `[A-Za-z0-9_-]` pass through; everything else (including `%`
/// itself, dots, and separators) becomes `%XX`. The encoding is injective,
/// so distinct identifiers never share a directory.
pub fn encode_session_id(session_id: &str) -> String {
    let mut encoded = String::with_capacity(session_id.len());
    for byte in session_id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    encoded
}

/// Validate that `name` addresses a direct member of the workspace.
///
/// Only bare file names are accepted; separators, parent references, and
/// reserved prefixes are rejected with `PathEscape` rather than being
/// silently rewritten. Escape attempts are logged as notable events.
fn member_path(dir: &Path, name: &str) -> Result<PathBuf, WorkspaceError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && !name.starts_with(TMP_PREFIX);
    if !valid {
        warn!(name = name, "Rejected workspace path escape attempt");
        return Err(WorkspaceError::PathEscape(name.to_string()));
    }
    Ok(dir.join(name))
}

// ============================================================================
// Tests
// ============================================================================
