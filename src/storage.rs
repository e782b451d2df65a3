//! Snapshot persistence
//!
//! Analytics and feedback keep their state in memory and write small JSON
//! snapshots through a pluggable store. Writes are best-effort: a failed
//! save is logged by the caller and in-memory state is preserved. The file
//! store writes atomically (temp + rename) to avoid torn snapshots.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Snapshot store errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Underlying file I/O failed
    #[error("Snapshot I/O error: {source}")]
    Io {
        /// Source I/O error
        #[from]
        source: std::io::Error,
    },

    /// The snapshot body could not be encoded or decoded
    #[error("Snapshot serialization error: {source}")]
    Serialization {
        /// Source JSON error
        #[from]
        source: serde_json::Error,
    },
}

/// Pluggable persistence for small JSON-shaped snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persists a snapshot, replacing any previous one
    async fn save(&self, snapshot: &Value) -> Result<(), SnapshotError>;

    /// Loads the last snapshot, or `None` when nothing was saved yet
    async fn load(&self) -> Result<Option<Value>, SnapshotError>;
}

/// File-backed store writing pretty-printed JSON atomically
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Creates a store for the given snapshot path
    #[must_use]
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// The snapshot path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn save(&self, snapshot: &Value) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // temp + rename so readers never observe a torn snapshot
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(snapshot)?;
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), "snapshot saved");
        Ok(())
    }

    async fn load(&self) -> Result<Option<Value>, SnapshotError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let value: Value = serde_json::from_str(&raw)?;
        Ok(Some(value))
    }
}
