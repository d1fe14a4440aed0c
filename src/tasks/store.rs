//! The task store: the only mutation surface for tasks.
//!
//! The store keeps every task (active and soft-deleted) in memory, newest
//! first, and hands a fresh [`Envelope`] to the [`PersistenceGateway`]
//! after each successful mutation. Calls are synchronous; persistence is
//! write-behind and its failures arrive on the gateway's event channel.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::persistence::{PersistenceGateway, QuotaRelief};
use crate::tasks::id::generate_task_id;
use crate::tasks::models::{
    Envelope, Origin, Task, TaskEvent, TaskEventKind, TaskPatch, SCHEMA_VERSION,
};
use crate::tasks::validation::validate_text;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Default retention for soft-deleted tasks before they may be purged.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Tuning for a [`TaskStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// How long soft-deleted tasks are kept when purging to free space.
    pub retention: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { retention: Duration::days(DEFAULT_RETENTION_DAYS) }
    }
}

#[derive(Debug)]
struct StoreState {
    // Insertion order, newest first.
    tasks: Vec<Task>,
    last_stamp: DateTime<Utc>,
}

struct StoreInner {
    state: Mutex<StoreState>,
    gateway: Arc<PersistenceGateway>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<TaskEvent>,
    options: StoreOptions,
}

/// In-memory task collection with write-behind persistence.
///
/// Cloning a `TaskStore` yields another handle to the same tasks.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("tasks", &self.inner.state.lock().tasks.len())
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl TaskStore {
    /// Load the persisted tasks and register the store as the gateway's
    /// quota relief.
    ///
    /// # Errors
    ///
    /// Returns an error if the host store cannot be reached. A corrupted
    /// envelope is not an error; the store starts empty.
    pub async fn open(
        gateway: Arc<PersistenceGateway>,
        clock: Arc<dyn Clock>,
        options: StoreOptions,
    ) -> Result<Self> {
        let envelope = gateway.read().await?;
        let last_stamp = envelope
            .tasks
            .iter()
            .flat_map(|t| [Some(t.created_at), Some(t.updated_at), t.deleted_at])
            .flatten()
            .max()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        info!(tasks = envelope.tasks.len(), "task store opened");

        let (events, _) = broadcast::channel(256);
        let inner = Arc::new(StoreInner {
            state: Mutex::new(StoreState { tasks: envelope.tasks, last_stamp }),
            gateway,
            clock,
            events,
            options,
        });

        let relief: Arc<dyn QuotaRelief> = inner.clone();
        inner.gateway.set_relief(Arc::downgrade(&relief));

        Ok(Self { inner })
    }

    /// The gateway this store persists through.
    #[must_use]
    pub fn gateway(&self) -> &Arc<PersistenceGateway> {
        &self.inner.gateway
    }

    /// Subscribe to change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// Create a new task at the head of the list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the text is empty or too long after
    /// trimming.
    pub fn create(&self, text: &str) -> Result<Task> {
        let text = validate_text(text)?;
        let mut state = self.inner.state.lock();
        let now = self.inner.stamp(&mut state);

        let task = Task {
            id: generate_task_id(),
            text,
            completed: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
            deleted_at: None,
            version: 1,
        };
        state.tasks.insert(0, task.clone());
        self.inner.commit(&state, TaskEventKind::Created, &task, Origin::Local);
        debug!(id = %task.id, "task created");
        Ok(task)
    }

    /// Apply a partial update to an active task.
    ///
    /// Completing a task stamps `completed_at`; reopening clears it. An
    /// empty patch returns the task unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no active task has this id, or
    /// [`Error::Validation`] if new text is invalid.
    pub fn update(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        let text = patch.text.as_deref().map(validate_text).transpose()?;
        let mut state = self.inner.state.lock();
        let index = active_index(&state, id)?;
        if patch.is_empty() {
            return Ok(state.tasks[index].clone());
        }

        let now = self.inner.stamp(&mut state);
        let task = &mut state.tasks[index];
        if let Some(text) = text {
            task.text = text;
        }
        if let Some(completed) = patch.completed {
            match (task.completed, completed) {
                (false, true) => task.completed_at = Some(now),
                (true, false) => task.completed_at = None,
                _ => {}
            }
            task.completed = completed;
        }
        task.updated_at = now;

        let task = task.clone();
        self.inner.commit(&state, TaskEventKind::Updated, &task, Origin::Local);
        Ok(task)
    }

    /// Soft-delete an active task. It stays restorable until purged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the task is missing or already deleted.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        let index = active_index(&state, id)?;
        let now = self.inner.stamp(&mut state);

        let task = &mut state.tasks[index];
        task.deleted_at = Some(now);
        task.updated_at = now;

        let task = task.clone();
        self.inner.commit(&state, TaskEventKind::Deleted, &task, Origin::Local);
        Ok(())
    }

    /// Bring a soft-deleted task back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the task is missing or not deleted.
    pub fn restore(&self, id: &str) -> Result<Task> {
        let mut state = self.inner.state.lock();
        let index = state
            .tasks
            .iter()
            .position(|t| t.id == id && t.is_deleted())
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let now = self.inner.stamp(&mut state);

        let task = &mut state.tasks[index];
        task.deleted_at = None;
        task.updated_at = now;

        let task = task.clone();
        self.inner.commit(&state, TaskEventKind::Restored, &task, Origin::Local);
        Ok(task)
    }

    /// Get any stored task, active or soft-deleted.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Task> {
        self.inner.state.lock().tasks.iter().find(|t| t.id == id).cloned()
    }

    /// Active tasks, newest `created_at` first. Tasks created at the same
    /// instant keep insertion order, most recently inserted first.
    #[must_use]
    pub fn list_active(&self) -> Vec<Task> {
        let state = self.inner.state.lock();
        let mut tasks: Vec<Task> = state.tasks.iter().filter(|t| t.is_active()).cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// Soft-deleted tasks, most recently deleted first.
    #[must_use]
    pub fn list_deleted(&self) -> Vec<Task> {
        let state = self.inner.state.lock();
        let mut tasks: Vec<Task> = state.tasks.iter().filter(|t| t.is_deleted()).cloned().collect();
        tasks.sort_by(|a, b| b.deleted_at.cmp(&a.deleted_at));
        tasks
    }

    /// Permanently remove soft-deleted tasks deleted more than `retention` ago.
    ///
    /// Returns the number of tasks removed. This cannot be undone.
    pub fn purge_expired_deletions(&self, retention: Duration) -> usize {
        self.inner.purge_expired(retention)
    }

    /// Apply a task as reported by the remote service.
    ///
    /// Inserts unknown tasks and overwrites known ones, including soft-deleted
    /// ones, since the remote copy is authoritative. A remote copy older than
    /// the local version is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] if the remote task is structurally invalid.
    pub fn apply_remote(&self, remote: Task) -> Result<Task> {
        remote.check().map_err(Error::Remote)?;
        let mut state = self.inner.state.lock();

        let Some(index) = state.tasks.iter().position(|t| t.id == remote.id) else {
            let at = state
                .tasks
                .iter()
                .position(|t| t.created_at <= remote.created_at)
                .unwrap_or(state.tasks.len());
            state.tasks.insert(at, remote.clone());
            state.last_stamp = state.last_stamp.max(remote.updated_at);
            self.inner.commit(&state, TaskEventKind::Created, &remote, Origin::Remote);
            return Ok(remote);
        };

        let local = &mut state.tasks[index];
        if remote.version < local.version {
            debug!(
                id = %remote.id,
                local = local.version,
                remote = remote.version,
                "ignoring older remote copy"
            );
            return Ok(local.clone());
        }

        let kind = match (local.is_deleted(), remote.is_deleted()) {
            (false, true) => TaskEventKind::Deleted,
            (true, false) => TaskEventKind::Restored,
            _ => TaskEventKind::Updated,
        };
        let created_at = local.created_at;
        *local = Task { created_at, updated_at: remote.updated_at.max(created_at), ..remote };

        let task = local.clone();
        state.last_stamp = state.last_stamp.max(task.updated_at);
        self.inner.commit(&state, kind, &task, Origin::Remote);
        Ok(task)
    }

    /// Record the version the remote service assigned after a push.
    ///
    /// Versions never move backwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the task no longer exists locally.
    pub fn acknowledge_version(&self, id: &str, version: u64) -> Result<()> {
        let mut state = self.inner.state.lock();
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if version <= task.version {
            return Ok(());
        }
        task.version = version;
        self.inner.persist(&state);
        Ok(())
    }

    /// Push any pending write to the host store now.
    ///
    /// # Errors
    ///
    /// Returns the gateway's error, e.g. [`Error::StorageFull`].
    pub async fn flush(&self) -> Result<()> {
        self.inner.gateway.flush().await
    }
}

fn active_index(state: &StoreState, id: &str) -> Result<usize> {
    state
        .tasks
        .iter()
        .position(|t| t.id == id && t.is_active())
        .ok_or_else(|| Error::NotFound(id.to_string()))
}

impl StoreInner {
    /// The current time, never earlier than any stamp issued before.
    fn stamp(&self, state: &mut StoreState) -> DateTime<Utc> {
        let now = self.clock.now().max(state.last_stamp);
        state.last_stamp = now;
        now
    }

    fn envelope(&self, state: &StoreState) -> Envelope {
        Envelope {
            schema_version: SCHEMA_VERSION.to_string(),
            last_modified: self.clock.now().max(state.last_stamp),
            tasks: state.tasks.clone(),
        }
    }

    fn persist(&self, state: &StoreState) {
        self.gateway.write(self.envelope(state));
    }

    fn commit(&self, state: &StoreState, kind: TaskEventKind, task: &Task, origin: Origin) {
        self.persist(state);
        let _ = self.events.send(TaskEvent { kind, task: task.clone(), origin });
    }

    fn purge_expired(&self, retention: Duration) -> usize {
        let mut state = self.state.lock();
        let cutoff = self.clock.now() - retention;

        let (purged, kept): (Vec<Task>, Vec<Task>) = std::mem::take(&mut state.tasks)
            .into_iter()
            .partition(|t| t.deleted_at.is_some_and(|at| at < cutoff));
        state.tasks = kept;

        if purged.is_empty() {
            return 0;
        }

        self.persist(&state);
        for task in &purged {
            let _ = self.events.send(TaskEvent {
                kind: TaskEventKind::Purged,
                task: task.clone(),
                origin: Origin::Local,
            });
        }
        info!(purged = purged.len(), "purged expired deletions");
        purged.len()
    }
}

impl QuotaRelief for StoreInner {
    fn relieve(&self) -> usize {
        let purged = self.purge_expired(self.options.retention);
        if purged == 0 {
            warn!("no expired deletions to purge");
        }
        purged
    }
}
