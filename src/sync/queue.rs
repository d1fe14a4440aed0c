//! The offline operation queue (outbox).
//!
//! Every local mutation becomes an [`OfflineOperation`]. Only a task's
//! latest snapshot needs pushing, so a mutation folds into the task's
//! newest pending operation instead of growing the queue. The queue is
//! persisted write-through next to the task envelope, together with the
//! pull cursor and any unresolved conflicts, so nothing is lost across
//! restarts.

use crate::error::Result;
use crate::persistence::KeyValueHost;
use crate::sync::conflict::ConflictRecord;
use crate::tasks::id::generate_operation_id;
use crate::tasks::models::{Origin, Task, TaskEvent, TaskEventKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::warn;

/// Default host key for the persisted outbox.
pub const DEFAULT_OUTBOX_KEY: &str = "tasksync.outbox";

/// What a queued operation asks the remote service to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Create the task remotely.
    Create,
    /// Replace the remote copy.
    Update,
    /// Mark the remote copy deleted.
    Delete,
}

impl OperationKind {
    /// The name used in logs and the CLI.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an operation is in its lifecycle.
///
/// `Acknowledged` and `Abandoned` operations leave the queue; they are
/// reported on the sync event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    /// Waiting to be pushed.
    Pending,
    /// Currently being pushed.
    InFlight,
    /// Accepted by the remote service.
    Acknowledged,
    /// Rejected with a version conflict; held until resolved.
    Conflicted,
    /// Dropped after too many failed attempts.
    Abandoned,
}

/// A local mutation waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineOperation {
    /// Unique operation id.
    pub id: String,
    /// What to do remotely.
    pub kind: OperationKind,
    /// The task the operation applies to.
    pub task_id: String,
    /// Snapshot of the task when the mutation happened.
    pub payload: Task,
    /// When the operation was queued.
    pub enqueued_at: DateTime<Utc>,
    /// Failed push attempts so far.
    pub retry_count: u32,
    /// Lifecycle state.
    pub state: OperationState,
}

impl OfflineOperation {
    /// A new pending operation.
    #[must_use]
    pub fn new(kind: OperationKind, payload: Task, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id: generate_operation_id(),
            kind,
            task_id: payload.id.clone(),
            payload,
            enqueued_at,
            retry_count: 0,
            state: OperationState::Pending,
        }
    }

    /// The operation a local task event should queue, if any.
    ///
    /// Remote-origin events and purges produce nothing.
    #[must_use]
    pub fn from_event(event: &TaskEvent, enqueued_at: DateTime<Utc>) -> Option<Self> {
        if event.origin == Origin::Remote {
            return None;
        }
        let kind = match event.kind {
            TaskEventKind::Created => OperationKind::Create,
            TaskEventKind::Updated | TaskEventKind::Restored => OperationKind::Update,
            TaskEventKind::Deleted => OperationKind::Delete,
            TaskEventKind::Purged => return None,
        };
        Some(Self::new(kind, event.task.clone(), enqueued_at))
    }
}

/// Queued operations plus sync bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbox {
    /// Cursor returned by the last successful pull.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Operations in enqueue order.
    #[serde(default)]
    pub operations: VecDeque<OfflineOperation>,
    /// Conflicts waiting for a resolution.
    #[serde(default)]
    pub conflicts: Vec<ConflictRecord>,
}

impl Outbox {
    /// Queue an operation.
    ///
    /// If the task's newest queued operation is still pending it absorbs
    /// this one: it takes the newer payload, and the newer kind unless it is
    /// a `Create`. Operations held by a conflict or in flight are never
    /// rewritten. Returns `true` if a new entry was appended.
    pub fn push(&mut self, operation: OfflineOperation) -> bool {
        let newest = self.operations.iter_mut().rev().find(|op| op.task_id == operation.task_id);
        if let Some(newest) = newest.filter(|op| op.state == OperationState::Pending) {
            if newest.kind != OperationKind::Create {
                newest.kind = operation.kind;
            }
            newest.payload = operation.payload;
            return false;
        }
        self.operations.push_back(operation);
        true
    }

    /// Remove an operation by id.
    pub fn remove(&mut self, operation_id: &str) -> Option<OfflineOperation> {
        let index = self.operations.iter().position(|op| op.id == operation_id)?;
        self.operations.remove(index)
    }

    /// Mutable access to an operation by id.
    pub fn get_mut(&mut self, operation_id: &str) -> Option<&mut OfflineOperation> {
        self.operations.iter_mut().find(|op| op.id == operation_id)
    }

    /// Task ids with an operation held by a conflict.
    #[must_use]
    pub fn held_task_ids(&self) -> HashSet<String> {
        self.operations
            .iter()
            .filter(|op| op.state == OperationState::Conflicted)
            .map(|op| op.task_id.clone())
            .collect()
    }

    /// Task ids with any queued operation.
    #[must_use]
    pub fn queued_task_ids(&self) -> HashSet<String> {
        self.operations.iter().map(|op| op.task_id.clone()).collect()
    }

    fn normalize(&mut self) {
        // A crash mid-push leaves operations in flight; they go back to pending.
        for op in &mut self.operations {
            if op.state == OperationState::InFlight {
                op.state = OperationState::Pending;
            }
        }
        self.operations
            .retain(|op| matches!(op.state, OperationState::Pending | OperationState::Conflicted));
        self.operations.make_contiguous().sort_by_key(|op| op.enqueued_at);
    }
}

/// Loads and saves the [`Outbox`] under a single host key.
#[derive(Clone)]
pub struct OutboxStore {
    host: Arc<dyn KeyValueHost>,
    key: String,
}

impl std::fmt::Debug for OutboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxStore").field("key", &self.key).finish_non_exhaustive()
    }
}

impl OutboxStore {
    /// Create a store writing to `key`.
    #[must_use]
    pub fn new(host: Arc<dyn KeyValueHost>, key: impl Into<String>) -> Self {
        Self { host, key: key.into() }
    }

    /// Load the outbox. A missing or unreadable value yields an empty one.
    ///
    /// # Errors
    ///
    /// Returns an error if the host store cannot be reached.
    pub async fn load(&self) -> Result<Outbox> {
        let Some(raw) = self.host.get(&self.key).await? else {
            return Ok(Outbox::default());
        };
        match serde_json::from_str::<Outbox>(&raw) {
            Ok(mut outbox) => {
                outbox.normalize();
                Ok(outbox)
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "discarding unreadable outbox");
                Ok(Outbox::default())
            }
        }
    }

    /// Save the outbox, replacing the previous copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the host store rejects the write.
    pub async fn save(&self, outbox: &Outbox) -> Result<()> {
        let raw = serde_json::to_string(outbox)?;
        self.host.set(&self.key, &raw).await?;
        Ok(())
    }
}
