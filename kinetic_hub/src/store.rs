//! # Snapshot Storage
//!
//! Small JSON and text files written next to the hub: one file per session
//! plus the helpers used by the state store and the recorder.
//!
//! Every write goes to a temporary sibling first and is renamed into place,
//! so a reader never sees a half-written snapshot.

use kinetic_common::session::Session;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

/// Snapshot file failure.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Write `bytes` to `path` through a temporary file and a rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(parent, e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes)
        .await
        .map_err(|e| StorageError::io(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| StorageError::io(path, e))
}

/// Serialize `value` as pretty JSON and write it atomically.
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes).await
}

/// Per-session JSON files in one directory (`{dir}/{session_id}.json`).
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the snapshot for `id`.
    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub async fn save(&self, session: &Session) -> Result<(), StorageError> {
        write_json(&self.path_for(&session.id), session).await
    }

    /// Read every snapshot in the directory.
    ///
    /// A missing directory is an empty store. Unreadable or malformed files
    /// are skipped with a warning.
    pub async fn load_all(&self) -> Result<Vec<Session>, StorageError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&self.dir, e)),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = match fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) => {
                    warn!("Skipping unreadable session file {}: {e}", path.display());
                    continue;
                }
            };
            match serde_json::from_str::<Session>(&text) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("Skipping malformed session file {}: {e}", path.display()),
            }
        }
        debug!(count = sessions.len(), dir = %self.dir.display(), "Loaded session snapshots");
        Ok(sessions)
    }

    /// Delete the snapshot for `id`. A missing file is not an error.
    pub async fn remove(&self, id: &str) -> Result<(), StorageError> {
        let path = self.path_for(id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }
}
