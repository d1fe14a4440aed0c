//! Error types for `tasksync`.

use crate::sync::ConflictRecord;
use crate::tasks::validation::ValidationError;

/// Errors that can occur in the task store, persistence and sync layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Task text failed validation. Never persisted.
    #[error("invalid task text: {0}")]
    Validation(#[from] ValidationError),

    /// The target task does not exist or is not in the required state.
    #[error("task not found: {0}")]
    NotFound(String),

    /// The host store is full even after purging expired deletions.
    #[error(
        "storage is full ({attempted_bytes} bytes needed, capacity {capacity_bytes} bytes); \
         empty the trash or delete some tasks"
    )]
    StorageFull {
        /// Size of the envelope that could not be written.
        attempted_bytes: u64,
        /// Capacity reported by the host store.
        capacity_bytes: u64,
    },

    /// The persisted envelope could not be read back.
    #[error("corrupted task state: {0}")]
    CorruptedState(String),

    /// The remote copy of a task has advanced past the version we last saw.
    #[error(
        "sync conflict on task {}: local version {}, remote version {}",
        .0.task_id,
        .0.local_version,
        .0.remote_version
    )]
    SyncConflict(Box<ConflictRecord>),

    /// A network call failed in a way that may succeed on retry.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The remote service rejected a request for a reason other than a conflict.
    #[error("remote rejected request: {0}")]
    Remote(String),

    /// The host key-value store failed.
    #[error("host store error: {0}")]
    Host(#[from] crate::persistence::HostError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON parsing error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A YAML parsing error occurred.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A `SQLite` database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl Error {
    /// Whether the failed operation may succeed if attempted again.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
