//! Conflict records and how to resolve them.

use crate::tasks::models::Task;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A push rejected because the remote copy moved past the version we saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// The task both sides changed.
    pub task_id: String,
    /// The queued operation that was rejected.
    pub operation_id: String,
    /// The version the push expected.
    pub local_version: u64,
    /// The version the remote service holds.
    pub remote_version: u64,
    /// The local copy that was pushed.
    pub local_task: Task,
    /// The remote copy at the time of the rejection.
    pub remote_task: Task,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
}

/// Caller-supplied reconciliation of a local and a remote copy.
///
/// Receives `(local, remote)` and returns the task to push. The id and
/// creation time of the result are forced to match the conflicted task.
pub type MergeFn = Box<dyn FnOnce(&Task, &Task) -> Task + Send>;

/// How to settle a [`ConflictRecord`].
pub enum Resolution {
    /// Push the local copy over the remote one.
    UseLocal,
    /// Replace the local copy with the remote one.
    UseRemote,
    /// Push the result of a caller-supplied merge.
    Merge(MergeFn),
}

impl Resolution {
    /// Merge with [`last_writer_wins`].
    #[must_use]
    pub fn last_writer_wins() -> Self {
        Self::Merge(Box::new(last_writer_wins))
    }
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UseLocal => write!(f, "UseLocal"),
            Self::UseRemote => write!(f, "UseRemote"),
            Self::Merge(_) => write!(f, "Merge(..)"),
        }
    }
}

/// The only merge this crate ships: last writer wins, per field.
///
/// Tasks carry a single `updated_at`, so for every field whose values
/// differ the copy with the later `updated_at` wins; on a tie the remote
/// copy wins. Completion state and its timestamp move together, as do
/// deletion and its timestamp. Nothing finer-grained is inferred.
#[must_use]
pub fn last_writer_wins(local: &Task, remote: &Task) -> Task {
    let winner = if local.updated_at > remote.updated_at { local } else { remote };
    let pick = |field_differs: bool| if field_differs { winner } else { remote };

    let text_from = pick(local.text != remote.text);
    let completion_from = pick(local.completed != remote.completed);
    let deletion_from = pick(local.deleted_at.is_some() != remote.deleted_at.is_some());

    Task {
        id: remote.id.clone(),
        text: text_from.text.clone(),
        completed: completion_from.completed,
        created_at: local.created_at.min(remote.created_at),
        updated_at: local.updated_at.max(remote.updated_at),
        completed_at: completion_from.completed_at,
        deleted_at: deletion_from.deleted_at,
        version: remote.version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn task(text: &str, minutes: i64) -> Task {
        let base = DateTime::<Utc>::UNIX_EPOCH + Duration::days(19_000);
        Task {
            id: "t".to_string(),
            text: text.to_string(),
            completed: false,
            created_at: base,
            updated_at: base + Duration::minutes(minutes),
            completed_at: None,
            deleted_at: None,
            version: 2,
        }
    }

    #[test]
    fn test_later_local_edit_wins() {
        let local = task("local text", 10);
        let mut remote = task("remote text", 5);
        remote.version = 3;

        let merged = last_writer_wins(&local, &remote);
        assert_eq!(merged.text, "local text");
        assert_eq!(merged.version, 3);
        assert_eq!(merged.updated_at, local.updated_at);
    }

    #[test]
    fn test_tie_goes_to_remote() {
        let local = task("local", 5);
        let remote = task("remote", 5);
        assert_eq!(last_writer_wins(&local, &remote).text, "remote");
    }

    #[test]
    fn test_completion_moves_with_its_timestamp() {
        let local = task("same", 1);
        let mut remote = task("same", 9);
        remote.completed = true;
        remote.completed_at = Some(remote.updated_at);

        let merged = last_writer_wins(&local, &remote);
        assert!(merged.completed);
        assert_eq!(merged.completed_at, remote.completed_at);
    }

    #[test]
    fn test_later_local_delete_wins() {
        let mut local = task("same", 20);
        local.deleted_at = Some(local.updated_at);
        let remote = task("same", 9);

        assert_eq!(last_writer_wins(&local, &remote).deleted_at, local.deleted_at);
    }

    #[test]
    fn test_resolution_debug() {
        assert_eq!(format!("{:?}", Resolution::last_writer_wins()), "Merge(..)");
        assert_eq!(format!("{:?}", Resolution::UseLocal), "UseLocal");
    }
}
