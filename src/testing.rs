//! Testing utilities and mock implementations.
//!
//! These types are provided for use in tests. They may appear unused in
//! the library itself but are consumed by unit and integration tests.

#![allow(dead_code)]

use crate::sync::{RemoteChanges, RemoteError, RemoteTaskService};
use crate::tasks::models::Task;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};

/// A call made against a [`MockRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    /// `fetch_since(cursor)`.
    FetchSince(Option<String>),
    /// `create(task)`.
    Create(String),
    /// `update(task, expected_version)`.
    Update {
        /// The task pushed.
        task_id: String,
        /// The version the client expected.
        expected_version: u64,
    },
}

#[derive(Debug, Default)]
struct RemoteState {
    tasks: BTreeMap<String, (Task, u64)>,
    seq: u64,
    failures: VecDeque<RemoteError>,
    reachable: bool,
    calls: Vec<RemoteCall>,
}

impl RemoteState {
    fn store(&mut self, task: Task) -> Task {
        self.seq += 1;
        self.tasks.insert(task.id.clone(), (task.clone(), self.seq));
        task
    }

    fn check_write(&mut self) -> Result<(), RemoteError> {
        if !self.reachable {
            return Err(RemoteError::Transient("remote unreachable".to_string()));
        }
        self.failures.pop_front().map_or(Ok(()), Err)
    }
}

/// An in-memory versioned task server.
///
/// Versions start at 1 and go up by one per accepted write. An update whose
/// expected version differs from the stored one is answered with
/// [`RemoteError::Conflict`]. The cursor is a change sequence number.
#[derive(Debug)]
pub struct MockRemote {
    state: Mutex<RemoteState>,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self { state: Mutex::new(RemoteState { reachable: true, ..RemoteState::default() }) }
    }
}

impl MockRemote {
    /// Create an empty server.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next write (`create` or `update`) with `error`.
    ///
    /// Failures queue up and are consumed in order. Fetches never consume them.
    pub fn fail_next(&self, error: RemoteError) {
        self.state.lock().failures.push_back(error);
    }

    /// Make every call fail with a transient error while `false`.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Write a task as another device would, bumping its version.
    ///
    /// Returns the stored copy.
    pub fn edit(&self, task: Task) -> Task {
        let mut state = self.state.lock();
        let version = state.tasks.get(&task.id).map_or(1, |(current, _)| current.version + 1);
        state.store(Task { version, ..task })
    }

    /// The stored copy of a task.
    #[must_use]
    pub fn task(&self, id: &str) -> Option<Task> {
        self.state.lock().tasks.get(id).map(|(task, _)| task.clone())
    }

    /// Every stored task.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.state.lock().tasks.values().map(|(task, _)| task.clone()).collect()
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    /// Task ids of every write attempted so far, in order.
    #[must_use]
    pub fn pushed_task_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                RemoteCall::Create(id) | RemoteCall::Update { task_id: id, .. } => Some(id.clone()),
                RemoteCall::FetchSince(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl RemoteTaskService for MockRemote {
    async fn fetch_since(&self, cursor: Option<&str>) -> Result<RemoteChanges, RemoteError> {
        let mut state = self.state.lock();
        state.calls.push(RemoteCall::FetchSince(cursor.map(str::to_string)));
        if !state.reachable {
            return Err(RemoteError::Transient("remote unreachable".to_string()));
        }

        let since = cursor.and_then(|c| c.parse::<u64>().ok()).unwrap_or(0);
        let tasks = state
            .tasks
            .values()
            .filter(|(_, seq)| *seq > since)
            .map(|(task, _)| task.clone())
            .collect();
        Ok(RemoteChanges { tasks, cursor: Some(state.seq.to_string()) })
    }

    async fn create(&self, task: &Task) -> Result<u64, RemoteError> {
        let mut state = self.state.lock();
        state.calls.push(RemoteCall::Create(task.id.clone()));
        state.check_write()?;

        if let Some((existing, _)) = state.tasks.get(&task.id) {
            return Err(RemoteError::Conflict { remote: existing.clone() });
        }
        Ok(state.store(Task { version: 1, ..task.clone() }).version)
    }

    async fn update(&self, task: &Task, expected_version: u64) -> Result<u64, RemoteError> {
        let mut state = self.state.lock();
        state.calls.push(RemoteCall::Update { task_id: task.id.clone(), expected_version });
        state.check_write()?;

        let Some((current, _)) = state.tasks.get(&task.id) else {
            return Err(RemoteError::Rejected(format!("unknown task {}", task.id)));
        };
        if current.version != expected_version {
            return Err(RemoteError::Conflict { remote: current.clone() });
        }
        Ok(state.store(Task { version: expected_version + 1, ..task.clone() }).version)
    }
}

/// A remote that fails every call with the same error.
#[derive(Debug)]
pub struct FailingRemote {
    error: RemoteError,
}

impl FailingRemote {
    /// Create a remote that always fails with `error`.
    #[must_use]
    pub const fn new(error: RemoteError) -> Self {
        Self { error }
    }
}

#[async_trait]
impl RemoteTaskService for FailingRemote {
    async fn fetch_since(&self, _cursor: Option<&str>) -> Result<RemoteChanges, RemoteError> {
        Err(self.error.clone())
    }

    async fn create(&self, _task: &Task) -> Result<u64, RemoteError> {
        Err(self.error.clone())
    }

    async fn update(&self, _task: &Task, _expected_version: u64) -> Result<u64, RemoteError> {
        Err(self.error.clone())
    }
}
