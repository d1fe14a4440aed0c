//! Task model types and the persisted envelope.

use crate::tasks::validation::validate_text;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Schema version written into every envelope.
pub const SCHEMA_VERSION: &str = "1";

/// A task in the tracker.
///
/// Optional timestamps are omitted from the serialized form when unset so
/// that readers of older schema versions keep working.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Opaque unique identifier, immutable once assigned.
    pub id: String,
    /// Trimmed task text, 1-280 characters.
    pub text: String,
    /// Whether the task is done.
    pub completed: bool,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task was last changed. Never earlier than `created_at`.
    pub updated_at: DateTime<Utc>,
    /// When the task was last marked complete, if it is complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the task was soft-deleted. Present means deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Remote version used for optimistic concurrency. Starts at 1.
    pub version: u64,
}

impl Task {
    /// Check if the task has been soft-deleted.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Check if the task is visible in active views.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !self.is_deleted()
    }

    /// Structural check used when loading persisted or remote data.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated invariant.
    pub fn check(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("task with empty id".to_string());
        }
        if self.version == 0 {
            return Err(format!("task {} has version 0", self.id));
        }
        if self.updated_at < self.created_at {
            return Err(format!("task {} was updated before it was created", self.id));
        }
        validate_text(&self.text).map_err(|e| format!("task {}: {e}", self.id))?;
        Ok(())
    }
}

/// Fields that can be changed by an ordinary update.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TaskPatch {
    /// New text (if Some). Validated like `create`.
    pub text: Option<String>,
    /// New completion state (if Some).
    pub completed: Option<bool>,
}

impl TaskPatch {
    /// Check if any fields are set for update.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.text.is_none() && self.completed.is_none()
    }

    /// A patch that only changes the completion state.
    #[must_use]
    pub const fn completed(completed: bool) -> Self {
        Self { text: None, completed: Some(completed) }
    }

    /// A patch that only changes the text.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), completed: None }
    }
}

/// The unit that is persisted: schema metadata plus every stored task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Schema version of the layout.
    pub schema_version: String,
    /// When the envelope was last built.
    pub last_modified: DateTime<Utc>,
    /// Every stored task (active and soft-deleted), newest first.
    pub tasks: Vec<Task>,
}

impl Envelope {
    /// An envelope with no tasks.
    #[must_use]
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self { schema_version: SCHEMA_VERSION.to_string(), last_modified: now, tasks: Vec::new() }
    }

    /// Validate the structure of a decoded envelope.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn check(&self) -> Result<(), String> {
        if self.schema_version.trim().is_empty() {
            return Err("missing schema version".to_string());
        }
        let mut seen = HashSet::with_capacity(self.tasks.len());
        for task in &self.tasks {
            task.check()?;
            if !seen.insert(task.id.as_str()) {
                return Err(format!("duplicate task id {}", task.id));
            }
        }
        Ok(())
    }
}

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// A user action on this device.
    Local,
    /// Applied from the remote service during sync.
    Remote,
}

/// What happened to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskEventKind {
    /// A task was created.
    Created,
    /// A task's fields changed.
    Updated,
    /// A task was soft-deleted.
    Deleted,
    /// A soft-deleted task was restored.
    Restored,
    /// A soft-deleted task was permanently removed.
    Purged,
}

impl TaskEventKind {
    /// Get the string representation of the kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Restored => "restored",
            Self::Purged => "purged",
        }
    }
}

impl std::fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Notification emitted by the task store after a successful mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    /// What happened.
    pub kind: TaskEventKind,
    /// The task after the change.
    pub task: Task,
    /// Who caused it.
    pub origin: Origin,
}
