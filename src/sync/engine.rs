//! The offline sync engine.
//!
//! Local mutations are captured from the task store's event channel into a
//! persisted outbox. While online, [`SyncEngine::flush_queue`] replays the
//! outbox in FIFO order against the remote service and then pulls remote
//! changes into the store. Pushes use optimistic concurrency: each carries
//! the version the client last saw, and a mismatch becomes a
//! [`ConflictRecord`] that holds later operations on the same task until
//! [`SyncEngine::resolve_conflict`] settles it. Other tasks keep syncing.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::persistence::KeyValueHost;
use crate::sync::conflict::{ConflictRecord, Resolution};
use crate::sync::queue::{
    OfflineOperation, OperationKind, OperationState, Outbox, OutboxStore, DEFAULT_OUTBOX_KEY,
};
use crate::sync::remote::{RemoteError, RemoteTaskService};
use crate::tasks::models::{Origin, Task, TaskEvent};
use crate::tasks::{validate_text, TaskStore};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// Default time between periodic syncs.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of failed pushes before an operation is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Tuning for a [`SyncEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Time between periodic syncs while online.
    pub interval: Duration,
    /// Failed pushes (other than conflicts) before an operation is abandoned.
    pub max_attempts: u32,
    /// Host key for the persisted outbox.
    pub outbox_key: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SYNC_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            outbox_key: DEFAULT_OUTBOX_KEY.to_string(),
        }
    }
}

/// Whether the remote service is believed to be reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    /// Pushes and pulls are attempted.
    #[default]
    Online,
    /// Mutations are queued only.
    Offline,
}

/// Notifications about sync progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// An operation was accepted by the remote service.
    Pushed {
        /// The task pushed.
        task_id: String,
        /// What was pushed.
        kind: OperationKind,
        /// The version the remote service assigned.
        version: u64,
    },
    /// A push was rejected with a version conflict.
    Conflict(Box<ConflictRecord>),
    /// An operation failed too many times and was dropped.
    Abandoned {
        /// The dropped operation.
        operation: Box<OfflineOperation>,
        /// The last failure.
        reason: String,
    },
    /// Remote changes were applied to the store.
    Pulled {
        /// Number of tasks applied.
        applied: usize,
    },
    /// A conflict was settled.
    Resolved {
        /// The task whose conflict was settled.
        task_id: String,
    },
    /// The outbox could not be written to the host store. Operations queued
    /// since the last successful save would not survive a restart.
    OutboxNotSaved {
        /// Human-readable reason.
        message: String,
    },
}

/// What a single [`SyncEngine::flush_queue`] pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Operations accepted by the remote service.
    pub pushed: usize,
    /// Operations rejected with a version conflict.
    pub conflicts: usize,
    /// Operations dropped after too many failures.
    pub abandoned: usize,
    /// Operations left in the queue for a later pass.
    pub deferred: usize,
    /// Remote tasks applied to the store.
    pub pulled: usize,
}

/// Queues local mutations and reconciles them with a remote service.
pub struct SyncEngine {
    store: TaskStore,
    remote: Arc<dyn RemoteTaskService>,
    outbox_store: OutboxStore,
    clock: Arc<dyn Clock>,
    options: SyncOptions,
    outbox: Mutex<Outbox>,
    connectivity: Mutex<Connectivity>,
    local_changes: Mutex<broadcast::Receiver<TaskEvent>>,
    events: broadcast::Sender<SyncEvent>,
    // Serializes flushes and conflict resolution.
    flushing: tokio::sync::Mutex<()>,
    // Serializes outbox saves so the last save carries the latest state.
    saving: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("queued", &self.outbox.lock().operations.len())
            .field("connectivity", &*self.connectivity.lock())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Load the persisted outbox and start capturing local mutations.
    ///
    /// The engine starts [`Connectivity::Online`].
    ///
    /// # Errors
    ///
    /// Returns an error if the host store cannot be reached.
    pub async fn open(
        store: TaskStore,
        remote: Arc<dyn RemoteTaskService>,
        host: Arc<dyn KeyValueHost>,
        clock: Arc<dyn Clock>,
        options: SyncOptions,
    ) -> Result<Arc<Self>> {
        let outbox_store = OutboxStore::new(host, options.outbox_key.clone());
        let outbox = outbox_store.load().await?;
        info!(
            queued = outbox.operations.len(),
            conflicts = outbox.conflicts.len(),
            "sync engine opened"
        );

        let local_changes = store.subscribe();
        let (events, _) = broadcast::channel(256);
        Ok(Arc::new(Self {
            store,
            remote,
            outbox_store,
            clock,
            options,
            outbox: Mutex::new(outbox),
            connectivity: Mutex::new(Connectivity::Online),
            local_changes: Mutex::new(local_changes),
            events,
            flushing: tokio::sync::Mutex::new(()),
            saving: tokio::sync::Mutex::new(()),
        }))
    }

    /// Subscribe to sync notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// The current connectivity state.
    #[must_use]
    pub fn connectivity(&self) -> Connectivity {
        *self.connectivity.lock()
    }

    /// Record a connectivity change.
    ///
    /// Returns `true` when the engine just came back online, which is when
    /// callers should flush.
    pub fn set_connectivity(&self, connectivity: Connectivity) -> bool {
        let previous = std::mem::replace(&mut *self.connectivity.lock(), connectivity);
        if previous == connectivity {
            return false;
        }
        info!(?connectivity, "connectivity changed");
        connectivity == Connectivity::Online
    }

    /// Queued operations, oldest first.
    #[must_use]
    pub fn pending_operations(&self) -> Vec<OfflineOperation> {
        self.outbox.lock().operations.iter().cloned().collect()
    }

    /// Conflicts waiting for a resolution.
    #[must_use]
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.outbox.lock().conflicts.clone()
    }

    /// The cursor of the last successful pull.
    #[must_use]
    pub fn cursor(&self) -> Option<String> {
        self.outbox.lock().cursor.clone()
    }

    /// Queue an operation and persist the outbox.
    ///
    /// A pending operation on the same task absorbs it (see [`Outbox::push`]).
    pub async fn enqueue(&self, operation: OfflineOperation) {
        log_queued(&operation);
        self.outbox.lock().push(operation);
        self.save_outbox().await;
    }

    /// Move local mutations seen since the last call into the outbox.
    ///
    /// Returns the number of mutations captured.
    pub async fn capture_local_changes(&self) -> usize {
        let events = {
            let mut receiver = self.local_changes.lock();
            let mut events = Vec::new();
            loop {
                match receiver.try_recv() {
                    Ok(event) => events.push(event),
                    Err(TryRecvError::Lagged(missed)) => {
                        error!(missed, "local changes were dropped before they could be queued");
                    }
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
            events
        };

        let captured = {
            let mut outbox = self.outbox.lock();
            // Keep enqueue times monotonic so FIFO order survives a reload.
            let now = outbox
                .operations
                .back()
                .map_or_else(|| self.clock.now(), |last| self.clock.now().max(last.enqueued_at));
            let mut captured = 0;
            let operations =
                events.iter().filter_map(|event| OfflineOperation::from_event(event, now));
            for operation in operations {
                log_queued(&operation);
                outbox.push(operation);
                captured += 1;
            }
            captured
        };

        if captured > 0 {
            self.save_outbox().await;
        }
        captured
    }

    /// Replay the outbox against the remote service, then pull remote changes.
    ///
    /// Does nothing beyond capturing local changes while offline. Failures
    /// are reported on the event channel and in the returned report, never
    /// as an error.
    #[instrument(skip(self))]
    pub async fn flush_queue(&self) -> FlushReport {
        let _flushing = self.flushing.lock().await;
        self.capture_local_changes().await;

        let mut report = FlushReport::default();
        if self.connectivity() == Connectivity::Offline {
            report.deferred = self.outbox.lock().operations.len();
            debug!(deferred = report.deferred, "offline; leaving queue for later");
            return report;
        }

        self.push_queued(&mut report).await;
        if self.connectivity() == Connectivity::Online {
            self.pull(&mut report).await;
        }
        self.save_outbox().await;

        info!(
            pushed = report.pushed,
            conflicts = report.conflicts,
            abandoned = report.abandoned,
            deferred = report.deferred,
            pulled = report.pulled,
            "sync pass finished"
        );
        report
    }

    async fn push_queued(&self, report: &mut FlushReport) {
        let (queued, mut blocked) = {
            let outbox = self.outbox.lock();
            let queued: Vec<OfflineOperation> = outbox
                .operations
                .iter()
                .filter(|op| op.state == OperationState::Pending)
                .cloned()
                .collect();
            (queued, outbox.held_task_ids())
        };

        for operation in queued {
            let offline = self.connectivity() == Connectivity::Offline;
            if offline || blocked.contains(&operation.task_id) {
                report.deferred += 1;
                continue;
            }
            self.set_state(&operation.id, OperationState::InFlight);

            let expected =
                self.store.get(&operation.task_id).map_or(operation.payload.version, |t| t.version);
            let result = match operation.kind {
                OperationKind::Create => self.remote.create(&operation.payload).await,
                OperationKind::Update | OperationKind::Delete => {
                    self.remote.update(&operation.payload, expected).await
                }
            };

            match result {
                Ok(version) => {
                    self.acknowledge(&operation, version);
                    report.pushed += 1;
                }
                Err(RemoteError::Conflict { remote }) => {
                    blocked.insert(operation.task_id.clone());
                    self.hold(&operation, expected, remote);
                    report.conflicts += 1;
                }
                Err(e) => {
                    // Later operations on this task must not overtake this one.
                    blocked.insert(operation.task_id.clone());
                    if self.record_failure(&operation, e.to_string()) {
                        report.abandoned += 1;
                    } else {
                        report.deferred += 1;
                    }
                }
            }
        }
    }

    fn set_state(&self, operation_id: &str, state: OperationState) {
        if let Some(operation) = self.outbox.lock().get_mut(operation_id) {
            operation.state = state;
        }
    }

    fn acknowledge(&self, operation: &OfflineOperation, version: u64) {
        self.outbox.lock().remove(&operation.id);
        match self.store.acknowledge_version(&operation.task_id, version) {
            Ok(()) => {}
            Err(Error::NotFound(_)) => {
                debug!(task = %operation.task_id, "pushed task no longer exists locally");
            }
            Err(e) => {
                warn!(task = %operation.task_id, error = %e, "could not record pushed version");
            }
        }
        debug!(op = %operation.id, task = %operation.task_id, version, "operation pushed");
        let _ = self.events.send(SyncEvent::Pushed {
            task_id: operation.task_id.clone(),
            kind: operation.kind,
            version,
        });
    }

    fn hold(&self, operation: &OfflineOperation, expected: u64, remote: Task) {
        let record = ConflictRecord {
            task_id: operation.task_id.clone(),
            operation_id: operation.id.clone(),
            local_version: expected,
            remote_version: remote.version,
            local_task: Task { version: expected, ..operation.payload.clone() },
            remote_task: remote,
            detected_at: self.clock.now(),
        };
        {
            let mut outbox = self.outbox.lock();
            if let Some(queued) = outbox.get_mut(&operation.id) {
                queued.state = OperationState::Conflicted;
            }
            outbox.conflicts.retain(|c| c.operation_id != operation.id);
            outbox.conflicts.push(record.clone());
        }
        warn!(
            task = %record.task_id,
            local_version = record.local_version,
            remote_version = record.remote_version,
            "sync conflict; holding operations for this task"
        );
        let _ = self.events.send(SyncEvent::Conflict(Box::new(record)));
    }

    /// Returns `true` if the operation was abandoned.
    fn record_failure(&self, operation: &OfflineOperation, reason: String) -> bool {
        let abandoned = {
            let mut outbox = self.outbox.lock();
            let Some(queued) = outbox.get_mut(&operation.id) else {
                return false;
            };
            queued.retry_count += 1;
            if queued.retry_count < self.options.max_attempts {
                queued.state = OperationState::Pending;
                debug!(
                    op = %operation.id,
                    attempts = queued.retry_count,
                    %reason,
                    "push failed; will retry"
                );
                return false;
            }
            queued.state = OperationState::Abandoned;
            outbox.remove(&operation.id)
        };

        let Some(abandoned) = abandoned else {
            return false;
        };
        warn!(
            op = %abandoned.id,
            kind = %abandoned.kind,
            task = %abandoned.task_id,
            attempts = abandoned.retry_count,
            %reason,
            "abandoning operation after repeated failures"
        );
        let _ = self.events.send(SyncEvent::Abandoned { operation: Box::new(abandoned), reason });
        true
    }

    async fn pull(&self, report: &mut FlushReport) {
        let cursor = self.cursor();
        let changes = match self.remote.fetch_since(cursor.as_deref()).await {
            Ok(changes) => changes,
            Err(e) => {
                warn!(error = %e, "pull failed; will retry on the next sync");
                return;
            }
        };

        // Tasks with queued operations are reconciled through their pushes.
        let queued = self.outbox.lock().queued_task_ids();
        let mut applied = 0;
        let mut skipped = 0;
        for task in changes.tasks {
            if queued.contains(&task.id) {
                debug!(task = %task.id, "skipping remote copy of a task with queued changes");
                skipped += 1;
                continue;
            }
            let newer = match self.store.get(&task.id) {
                Some(local) => task.version > local.version,
                None => true,
            };
            if !newer {
                continue;
            }
            let id = task.id.clone();
            match self.store.apply_remote(task) {
                Ok(_) => applied += 1,
                Err(e) => warn!(task = %id, error = %e, "ignoring invalid remote task"),
            }
        }

        // A skipped copy must come back if its queued operation is abandoned.
        match changes.cursor {
            Some(cursor) if skipped == 0 => self.outbox.lock().cursor = Some(cursor),
            Some(_) => debug!(skipped, "keeping the pull cursor until queued tasks settle"),
            None => {}
        }
        report.pulled = applied;
        if applied > 0 {
            let _ = self.events.send(SyncEvent::Pulled { applied });
        }
    }

    /// Settle a conflict.
    ///
    /// The outcome replaces the conflicted operation and every later queued
    /// operation on the same task, since each of those was a snapshot of a
    /// local copy the resolution has now reconciled.
    ///
    /// - [`Resolution::UseLocal`] pushes the current local copy over the
    ///   remote one, so the remote version moves past the conflicting one.
    /// - [`Resolution::UseRemote`] replaces the local copy with the remote one.
    /// - [`Resolution::Merge`] pushes the caller's merge and applies it locally.
    ///
    /// Returns the task as it now stands locally.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the conflict is not outstanding.
    /// - [`Error::SyncConflict`] if the remote copy moved again; the stored
    ///   record is refreshed and the conflict stays outstanding.
    /// - [`Error::TransientNetwork`] or [`Error::Remote`] if the push failed.
    /// - [`Error::Validation`] if a merge produced invalid text.
    #[instrument(skip(self, record), fields(task = %record.task_id))]
    pub async fn resolve_conflict(
        &self,
        record: &ConflictRecord,
        resolution: Resolution,
    ) -> Result<Task> {
        let _flushing = self.flushing.lock().await;
        // Edits made since the last pass are superseded below, not replayed later.
        self.capture_local_changes().await;
        let outstanding =
            self.outbox.lock().conflicts.iter().any(|c| c.operation_id == record.operation_id);
        if !outstanding {
            return Err(Error::NotFound(record.task_id.clone()));
        }

        let local = self.store.get(&record.task_id).unwrap_or_else(|| record.local_task.clone());
        let task = match resolution {
            Resolution::UseLocal => {
                let version = self.push_over(&local, record).await?;
                match self.store.acknowledge_version(&record.task_id, version) {
                    Ok(()) | Err(Error::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                Task { version, ..local }
            }
            Resolution::UseRemote => self.store.apply_remote(record.remote_task.clone())?,
            Resolution::Merge(merge) => {
                let merged = merge(&local, &record.remote_task);
                let merged = Task {
                    id: record.task_id.clone(),
                    text: validate_text(&merged.text)?,
                    created_at: local.created_at,
                    ..merged
                };
                let version = self.push_over(&merged, record).await?;
                self.store.apply_remote(Task { version, ..merged })?
            }
        };

        // The resolved copy supersedes every queued change to this task.
        let superseded = {
            let mut outbox = self.outbox.lock();
            let before = outbox.operations.len();
            outbox.operations.retain(|op| op.task_id != record.task_id);
            outbox.conflicts.retain(|c| c.task_id != record.task_id);
            before - outbox.operations.len()
        };
        self.save_outbox().await;

        info!(version = task.version, superseded, "conflict resolved");
        let _ = self.events.send(SyncEvent::Resolved { task_id: record.task_id.clone() });
        Ok(task)
    }

    async fn push_over(&self, task: &Task, record: &ConflictRecord) -> Result<u64> {
        match self.remote.update(task, record.remote_version).await {
            Ok(version) => Ok(version),
            Err(RemoteError::Conflict { remote }) => {
                let refreshed = ConflictRecord {
                    remote_version: remote.version,
                    remote_task: remote,
                    detected_at: self.clock.now(),
                    ..record.clone()
                };
                {
                    let mut outbox = self.outbox.lock();
                    outbox.conflicts.retain(|c| c.operation_id != record.operation_id);
                    outbox.conflicts.push(refreshed.clone());
                }
                self.save_outbox().await;
                warn!(
                    remote_version = refreshed.remote_version,
                    "remote moved again while resolving"
                );
                Err(Error::SyncConflict(Box::new(refreshed)))
            }
            Err(RemoteError::Transient(message)) => Err(Error::TransientNetwork(message)),
            Err(RemoteError::Rejected(message)) => Err(Error::Remote(message)),
        }
    }

    /// Sync periodically until `shutdown` is notified.
    ///
    /// Flushes on every tick of the configured interval (the first tick is
    /// immediate), whenever connectivity comes back, and after local
    /// mutations. Use [`Notify::notify_one`] to stop the loop so a
    /// notification sent between iterations is not lost.
    pub async fn run(
        &self,
        mut connectivity: watch::Receiver<Connectivity>,
        shutdown: Arc<Notify>,
    ) {
        let mut wake = self.store.subscribe();
        let mut ticker = tokio::time::interval(self.options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watching = true;
        self.set_connectivity(*connectivity.borrow_and_update());
        info!(interval = ?self.options.interval, "sync loop started");

        loop {
            tokio::select! {
                () = shutdown.notified() => break,
                _ = ticker.tick() => {
                    self.flush_queue().await;
                }
                changed = connectivity.changed(), if watching => {
                    if changed.is_err() {
                        debug!("connectivity source closed; keeping last state");
                        watching = false;
                        continue;
                    }
                    let now = *connectivity.borrow_and_update();
                    if self.set_connectivity(now) {
                        self.flush_queue().await;
                    }
                }
                event = wake.recv() => match event {
                    Ok(event) if event.origin == Origin::Local => {
                        // Coalesce a burst of mutations into one pass.
                        while wake.try_recv().is_ok() {}
                        self.flush_queue().await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        self.flush_queue().await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        self.capture_local_changes().await;
        info!("sync loop stopped");
    }

    /// Write the outbox to the host store now.
    ///
    /// # Errors
    ///
    /// Returns the host error if the write failed. Operations queued since
    /// the last successful save would then be lost on restart.
    pub async fn save(&self) -> Result<()> {
        let _saving = self.saving.lock().await;
        let snapshot = self.outbox.lock().clone();
        self.outbox_store.save(&snapshot).await
    }

    async fn save_outbox(&self) {
        if let Err(e) = self.save().await {
            error!(error = %e, "could not persist the sync outbox");
            let _ = self.events.send(SyncEvent::OutboxNotSaved { message: e.to_string() });
        }
    }

    /// Task ids whose operations are held by a conflict.
    #[must_use]
    pub fn held_task_ids(&self) -> HashSet<String> {
        self.outbox.lock().held_task_ids()
    }
}

fn log_queued(operation: &OfflineOperation) {
    debug!(
        op = %operation.id,
        kind = %operation.kind,
        task = %operation.task_id,
        "operation queued"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::{GatewayOptions, MemoryHost, PersistenceGateway};
    use crate::tasks::models::TaskPatch;
    use crate::tasks::StoreOptions;
    use crate::testing::{MockRemote, RemoteCall};

    struct Fixture {
        host: Arc<MemoryHost>,
        clock: Arc<ManualClock>,
        remote: Arc<MockRemote>,
        store: TaskStore,
        engine: Arc<SyncEngine>,
    }

    async fn create_test_engine() -> Fixture {
        create_engine_on(Arc::new(MemoryHost::default()), Arc::new(MockRemote::new())).await
    }

    async fn create_engine_on(host: Arc<MemoryHost>, remote: Arc<MockRemote>) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let gateway = PersistenceGateway::new(host.clone(), GatewayOptions::default());
        let store = TaskStore::open(gateway, clock.clone(), StoreOptions::default()).await.unwrap();
        let engine = SyncEngine::open(
            store.clone(),
            remote.clone(),
            host.clone(),
            clock.clone(),
            SyncOptions::default(),
        )
        .await
        .unwrap();
        Fixture { host, clock, remote, store, engine }
    }

    fn writes(remote: &MockRemote) -> Vec<RemoteCall> {
        remote.calls().into_iter().filter(|c| !matches!(c, RemoteCall::FetchSince(_))).collect()
    }

    #[tokio::test]
    async fn test_local_mutations_are_captured_in_order() {
        let f = create_test_engine().await;
        let a = f.store.create("A").unwrap();
        let b = f.store.create("B").unwrap();
        f.engine.flush_queue().await;
        f.store.update(&b.id, TaskPatch::completed(true)).unwrap();
        f.store.delete(&a.id).unwrap();

        assert_eq!(f.engine.capture_local_changes().await, 2);
        let queued: Vec<_> =
            f.engine.pending_operations().into_iter().map(|op| (op.task_id, op.kind)).collect();
        assert_eq!(queued, vec![(b.id, OperationKind::Update), (a.id, OperationKind::Delete)]);
    }

    #[tokio::test]
    async fn test_unpushed_create_carries_latest_snapshot() {
        let f = create_test_engine().await;
        let task = f.store.create("Buy milk").unwrap();
        f.store.update(&task.id, TaskPatch::text("Buy oat milk")).unwrap();

        let report = f.engine.flush_queue().await;

        assert_eq!(report.pushed, 1);
        assert_eq!(writes(&f.remote), vec![RemoteCall::Create(task.id.clone())]);
        assert_eq!(f.remote.task(&task.id).unwrap().text, "Buy oat milk");
    }

    #[tokio::test]
    async fn test_flush_pushes_and_acknowledges_versions() {
        let f = create_test_engine().await;
        let task = f.store.create("Buy milk").unwrap();
        f.engine.flush_queue().await;
        f.store.update(&task.id, TaskPatch::text("Buy oat milk")).unwrap();

        let report = f.engine.flush_queue().await;

        assert_eq!(report.pushed, 1);
        assert!(f.engine.pending_operations().is_empty());
        assert_eq!(f.remote.task(&task.id).unwrap().text, "Buy oat milk");
        assert_eq!(f.store.get(&task.id).unwrap().version, 2);
        assert_eq!(
            writes(&f.remote),
            vec![
                RemoteCall::Create(task.id.clone()),
                RemoteCall::Update { task_id: task.id.clone(), expected_version: 1 }
            ]
        );
    }

    #[tokio::test]
    async fn test_offline_edits_keep_outbox_bounded() {
        let host = Arc::new(MemoryHost::with_capacity(64 * 1024));
        let f = create_engine_on(host, Arc::new(MockRemote::new())).await;
        f.engine.set_connectivity(Connectivity::Offline);
        let mut events = f.engine.subscribe();
        let task = f.store.create("Toggle me").unwrap();

        for i in 0..4000 {
            f.store.update(&task.id, TaskPatch::completed(i % 2 == 0)).unwrap();
            if i % 100 == 0 {
                f.engine.capture_local_changes().await;
            }
        }
        f.engine.flush_queue().await;

        let queued = f.engine.pending_operations();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, OperationKind::Create);
        assert_eq!(queued[0].payload, f.store.get(&task.id).unwrap());
        assert!(f.host.raw(DEFAULT_OUTBOX_KEY).unwrap().len() < 2_000);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_outbox_save_is_reported() {
        let host = Arc::new(MemoryHost::with_capacity(64));
        let f = create_engine_on(host, Arc::new(MockRemote::new())).await;
        f.engine.set_connectivity(Connectivity::Offline);
        let mut events = f.engine.subscribe();

        f.store.create("Does not fit").unwrap();
        assert_eq!(f.engine.capture_local_changes().await, 1);

        assert!(matches!(events.try_recv().unwrap(), SyncEvent::OutboxNotSaved { .. }));
        assert!(matches!(f.engine.save().await, Err(Error::Host(_))));
        // The operation is still queued in memory for a later save.
        assert_eq!(f.engine.pending_operations().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_mutations_wait_for_connectivity() {
        let f = create_test_engine().await;
        f.engine.set_connectivity(Connectivity::Offline);
        f.store.create("A").unwrap();
        f.store.create("B").unwrap();

        let report = f.engine.flush_queue().await;
        assert_eq!(report.deferred, 2);
        assert!(f.remote.calls().is_empty());

        assert!(f.engine.set_connectivity(Connectivity::Online));
        let report = f.engine.flush_queue().await;
        assert_eq!(report.pushed, 2);
        assert_eq!(f.remote.tasks().len(), 2);
    }

    #[tokio::test]
    async fn test_set_connectivity_reports_reconnect_only() {
        let f = create_test_engine().await;
        assert!(!f.engine.set_connectivity(Connectivity::Online));
        assert!(!f.engine.set_connectivity(Connectivity::Offline));
        assert!(f.engine.set_connectivity(Connectivity::Online));
    }

    #[tokio::test]
    async fn test_conflict_produces_record_without_overwriting_remote() {
        let f = create_test_engine().await;
        let task = f.store.create("Draft").unwrap();
        f.engine.flush_queue().await;
        f.store.update(&task.id, TaskPatch::text("Local edit")).unwrap();
        f.engine.flush_queue().await;
        assert_eq!(f.store.get(&task.id).unwrap().version, 2);

        // Another device edits twice more.
        f.remote.edit(Task { text: "Remote edit".to_string(), ..f.remote.task(&task.id).unwrap() });
        f.store.update(&task.id, TaskPatch::completed(true)).unwrap();
        let mut events = f.engine.subscribe();

        let report = f.engine.flush_queue().await;

        assert_eq!(report.conflicts, 1);
        let conflicts = f.engine.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].local_version, 2);
        assert_eq!(conflicts[0].remote_version, 3);
        assert_eq!(f.remote.task(&task.id).unwrap().text, "Remote edit");
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::Conflict(_)));
        assert!(f.engine.held_task_ids().contains(&task.id));
    }

    #[tokio::test]
    async fn test_conflict_holds_same_task_but_not_others() {
        let f = create_test_engine().await;
        let a = f.store.create("A").unwrap();
        let b = f.store.create("B").unwrap();
        f.engine.flush_queue().await;

        f.remote.edit(Task { text: "B remote".to_string(), ..f.remote.task(&b.id).unwrap() });
        f.store.update(&b.id, TaskPatch::text("B local")).unwrap();
        assert_eq!(f.engine.flush_queue().await.conflicts, 1);
        f.store.update(&b.id, TaskPatch::completed(true)).unwrap();
        f.store.update(&a.id, TaskPatch::text("A local")).unwrap();

        let report = f.engine.flush_queue().await;

        assert_eq!(report.conflicts, 0);
        assert_eq!(report.pushed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(f.remote.task(&a.id).unwrap().text, "A local");
        let held: Vec<_> = f.engine.pending_operations().into_iter().map(|op| op.state).collect();
        assert_eq!(held, vec![OperationState::Conflicted, OperationState::Pending]);
    }

    #[tokio::test]
    async fn test_transient_failures_abandon_after_max_attempts() {
        let f = create_test_engine().await;
        let task = f.store.create("Flaky").unwrap();
        for _ in 0..3 {
            f.remote.fail_next(RemoteError::Transient("timeout".to_string()));
        }
        let mut events = f.engine.subscribe();

        assert_eq!(f.engine.flush_queue().await.deferred, 1);
        assert_eq!(f.engine.pending_operations()[0].retry_count, 1);
        assert_eq!(f.engine.flush_queue().await.deferred, 1);
        assert_eq!(f.engine.flush_queue().await.abandoned, 1);

        assert!(f.engine.pending_operations().is_empty());
        assert!(f.remote.task(&task.id).is_none());
        match events.recv().await.unwrap() {
            SyncEvent::Abandoned { operation, reason } => {
                assert_eq!(operation.task_id, task.id);
                assert_eq!(operation.state, OperationState::Abandoned);
                assert!(reason.contains("timeout"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_retries_latest_snapshot() {
        let f = create_test_engine().await;
        let task = f.store.create("First").unwrap();
        f.remote.fail_next(RemoteError::Transient("reset".to_string()));

        let report = f.engine.flush_queue().await;
        assert_eq!(report.pushed, 0);
        assert_eq!(report.deferred, 1);
        assert_eq!(f.remote.pushed_task_ids(), vec![task.id.clone()]);

        f.store.update(&task.id, TaskPatch::text("Second")).unwrap();
        let report = f.engine.flush_queue().await;
        assert_eq!(report.pushed, 1);
        assert_eq!(f.remote.task(&task.id).unwrap().text, "Second");
        assert!(f.engine.pending_operations().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_operation_lets_remote_copy_through() {
        let f = create_test_engine().await;
        let task = f.store.create("Shared").unwrap();
        f.engine.flush_queue().await;

        let elsewhere = f.remote.task(&task.id).unwrap();
        f.remote.edit(Task { text: "Edited elsewhere".to_string(), ..elsewhere });
        f.store.update(&task.id, TaskPatch::completed(true)).unwrap();
        for _ in 0..3 {
            f.remote.fail_next(RemoteError::Transient("timeout".to_string()));
        }

        f.engine.flush_queue().await;
        f.engine.flush_queue().await;
        let report = f.engine.flush_queue().await;

        assert_eq!(report.abandoned, 1);
        assert_eq!(report.pulled, 1);
        let local = f.store.get(&task.id).unwrap();
        assert_eq!(local, f.remote.task(&task.id).unwrap());
        assert_eq!(local.text, "Edited elsewhere");
    }

    #[tokio::test]
    async fn test_pull_applies_remote_only_changes() {
        let f = create_test_engine().await;
        let mine = f.store.create("Mine").unwrap();
        f.engine.flush_queue().await;

        let theirs = f.remote.edit(Task {
            id: "other-device".to_string(),
            text: "Theirs".to_string(),
            ..mine.clone()
        });
        f.remote.edit(Task { completed: true, ..f.remote.task(&mine.id).unwrap() });
        let mut task_events = f.store.subscribe();

        let report = f.engine.flush_queue().await;

        assert_eq!(report.pulled, 2);
        assert_eq!(f.store.get(&theirs.id).unwrap().text, "Theirs");
        assert!(f.store.get(&mine.id).unwrap().completed);
        assert_eq!(f.store.get(&mine.id).unwrap().version, 2);
        assert_eq!(task_events.recv().await.unwrap().origin, Origin::Remote);
        assert_eq!(f.engine.capture_local_changes().await, 0);
        assert!(f.engine.cursor().is_some());
    }

    #[tokio::test]
    async fn test_pull_failure_is_not_fatal() {
        let f = create_test_engine().await;
        f.remote.set_reachable(false);
        f.store.create("A").unwrap();

        let report = f.engine.flush_queue().await;
        assert_eq!(report.deferred, 1);
        assert!(f.engine.cursor().is_none());
    }

    async fn conflicted(f: &Fixture) -> (Task, ConflictRecord) {
        let task = f.store.create("Base").unwrap();
        f.engine.flush_queue().await;
        f.remote.edit(Task { text: "Remote".to_string(), ..f.remote.task(&task.id).unwrap() });
        f.clock.advance(chrono::Duration::minutes(5));
        f.store.update(&task.id, TaskPatch::text("Local")).unwrap();
        f.engine.flush_queue().await;
        let record = f.engine.conflicts().remove(0);
        (task, record)
    }

    #[tokio::test]
    async fn test_resolve_use_local() {
        let f = create_test_engine().await;
        let (task, record) = conflicted(&f).await;

        let resolved = f.engine.resolve_conflict(&record, Resolution::UseLocal).await.unwrap();

        assert_eq!(resolved.version, 3);
        assert_eq!(f.remote.task(&task.id).unwrap().text, "Local");
        assert_eq!(f.store.get(&task.id).unwrap().version, 3);
        assert!(f.engine.conflicts().is_empty());
        assert!(f.engine.pending_operations().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_use_remote() {
        let f = create_test_engine().await;
        let (task, record) = conflicted(&f).await;

        let resolved = f.engine.resolve_conflict(&record, Resolution::UseRemote).await.unwrap();

        assert_eq!(resolved.text, "Remote");
        assert_eq!(f.store.get(&task.id).unwrap().text, "Remote");
        assert_eq!(f.store.get(&task.id).unwrap().version, 2);
        assert!(f.engine.held_task_ids().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_with_last_writer_wins() {
        let f = create_test_engine().await;
        let (task, record) = conflicted(&f).await;

        let resolved =
            f.engine.resolve_conflict(&record, Resolution::last_writer_wins()).await.unwrap();

        assert_eq!(resolved.text, "Local");
        assert_eq!(resolved.version, 3);
        assert_eq!(f.remote.task(&task.id).unwrap().text, "Local");
    }

    #[tokio::test]
    async fn test_resolve_merge_rejects_invalid_text() {
        let f = create_test_engine().await;
        let (_, record) = conflicted(&f).await;

        let merge = Resolution::Merge(Box::new(|local: &Task, _: &Task| Task {
            text: "  ".to_string(),
            ..local.clone()
        }));
        let err = f.engine.resolve_conflict(&record, merge).await.unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(f.engine.conflicts().len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_when_remote_moved_again() {
        let f = create_test_engine().await;
        let (task, record) = conflicted(&f).await;
        let current = f.remote.task(&task.id).unwrap();
        f.remote.edit(Task { text: "Remote again".to_string(), ..current });

        let err = f.engine.resolve_conflict(&record, Resolution::UseLocal).await.unwrap_err();

        let Error::SyncConflict(refreshed) = err else {
            panic!("expected a conflict, got {err:?}");
        };
        assert_eq!(refreshed.remote_version, 3);
        assert_eq!(f.engine.conflicts()[0].remote_version, 3);

        let resolved = f.engine.resolve_conflict(&refreshed, Resolution::UseLocal).await.unwrap();
        assert_eq!(resolved.version, 4);
    }

    #[tokio::test]
    async fn test_resolve_unknown_conflict() {
        let f = create_test_engine().await;
        let (_, record) = conflicted(&f).await;
        f.engine.resolve_conflict(&record, Resolution::UseRemote).await.unwrap();

        let err = f.engine.resolve_conflict(&record, Resolution::UseRemote).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_resolve_supersedes_later_operations() {
        let f = create_test_engine().await;
        let (task, record) = conflicted(&f).await;
        f.store.update(&task.id, TaskPatch::completed(true)).unwrap();
        f.engine.flush_queue().await;
        assert_eq!(f.engine.pending_operations().len(), 2);

        f.engine.resolve_conflict(&record, Resolution::UseLocal).await.unwrap();

        assert!(f.engine.pending_operations().is_empty());
        let remote = f.remote.task(&task.id).unwrap();
        assert!(remote.completed);
        assert_eq!(remote.text, "Local");
        assert_eq!(f.engine.flush_queue().await.pushed, 0);
        assert_eq!(f.store.get(&task.id).unwrap().version, remote.version);
    }

    #[tokio::test]
    async fn test_resolve_use_remote_discards_uncaptured_edit() {
        let f = create_test_engine().await;
        let (task, record) = conflicted(&f).await;
        f.store.update(&task.id, TaskPatch::text("Local again")).unwrap();

        f.engine.resolve_conflict(&record, Resolution::UseRemote).await.unwrap();
        assert_eq!(f.store.get(&task.id).unwrap().text, "Remote");
        f.engine.flush_queue().await;

        let remote = f.remote.task(&task.id).unwrap();
        assert_eq!(remote.text, "Remote");
        assert_eq!(remote.version, 2);
        assert_eq!(f.store.get(&task.id).unwrap(), remote);
    }

    #[tokio::test]
    async fn test_resolve_use_remote_discards_local_changes() {
        let f = create_test_engine().await;
        let (task, record) = conflicted(&f).await;
        f.store.update(&task.id, TaskPatch::completed(true)).unwrap();
        f.engine.flush_queue().await;

        f.engine.resolve_conflict(&record, Resolution::UseRemote).await.unwrap();
        f.engine.flush_queue().await;

        let local = f.store.get(&task.id).unwrap();
        assert_eq!(local, f.remote.task(&task.id).unwrap());
        assert!(!local.completed);
    }

    #[tokio::test]
    async fn test_outbox_survives_restart() {
        let host = Arc::new(MemoryHost::default());
        let remote = Arc::new(MockRemote::new());
        {
            let f = create_engine_on(host.clone(), remote.clone()).await;
            f.engine.set_connectivity(Connectivity::Offline);
            f.store.create("Queued").unwrap();
            f.engine.flush_queue().await;
            f.store.flush().await.unwrap();
        }

        let f = create_engine_on(host, remote).await;
        assert_eq!(f.engine.pending_operations().len(), 1);
        assert_eq!(f.engine.flush_queue().await.pushed, 1);
        assert!(f.host.raw(DEFAULT_OUTBOX_KEY).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_syncs_and_stops() {
        let f = create_test_engine().await;
        let (tx, rx) = watch::channel(Connectivity::Offline);
        let shutdown = Arc::new(Notify::new());
        let engine = f.engine.clone();
        let stop = shutdown.clone();
        let handle = tokio::spawn(async move { engine.run(rx, stop).await });

        let task = f.store.create("From the loop").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.remote.task(&task.id).is_none());
        assert_eq!(f.engine.pending_operations().len(), 1);

        tx.send(Connectivity::Online).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.remote.task(&task.id).unwrap().version, 1);

        f.remote.edit(Task { id: "elsewhere".to_string(), ..task.clone() });
        tokio::time::sleep(DEFAULT_SYNC_INTERVAL).await;
        assert!(f.store.get("elsewhere").is_some());

        shutdown.notify_one();
        handle.await.unwrap();
    }
}
