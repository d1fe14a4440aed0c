//! Contract for the remote task service.
//!
//! The service is versioned: every accepted write returns the new version,
//! and an update whose `expected_version` does not match the server copy is
//! rejected with the server's copy so the caller can record a conflict.

use crate::tasks::models::Task;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Remote changes since a cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChanges {
    /// Tasks created or changed after the cursor.
    pub tasks: Vec<Task>,
    /// Cursor to pass on the next fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// Failures a remote call can report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The server's version differs from the expected one.
    #[error("version conflict: remote is at version {}", .remote.version)]
    Conflict {
        /// The server's current copy.
        remote: Task,
    },

    /// The call may succeed later (timeouts, connection resets, 5xx).
    #[error("transient failure: {0}")]
    Transient(String),

    /// The server refused the request for another reason.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Trait for the remote task service.
#[async_trait]
pub trait RemoteTaskService: Send + Sync {
    /// Fetch tasks changed since `cursor` (everything when `None`).
    async fn fetch_since(&self, cursor: Option<&str>) -> Result<RemoteChanges, RemoteError>;

    /// Create a task. Returns the version the server assigned.
    async fn create(&self, task: &Task) -> Result<u64, RemoteError>;

    /// Replace a task if the server still holds `expected_version`.
    /// Returns the new version.
    async fn update(&self, task: &Task, expected_version: u64) -> Result<u64, RemoteError>;
}

/// Stand-in for trackers with no remote service configured.
///
/// Every call fails transiently, so an engine built on it only queues.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedRemote;

const DETACHED: &str = "no remote service configured";

#[async_trait]
impl RemoteTaskService for DetachedRemote {
    async fn fetch_since(&self, _cursor: Option<&str>) -> Result<RemoteChanges, RemoteError> {
        Err(RemoteError::Transient(DETACHED.to_string()))
    }

    async fn create(&self, _task: &Task) -> Result<u64, RemoteError> {
        Err(RemoteError::Transient(DETACHED.to_string()))
    }

    async fn update(&self, _task: &Task, _expected_version: u64) -> Result<u64, RemoteError> {
        Err(RemoteError::Transient(DETACHED.to_string()))
    }
}
