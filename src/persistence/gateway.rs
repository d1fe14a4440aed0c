//! Capacity-aware persistence gateway.
//!
//! The gateway owns the durable copy of the task [`Envelope`]. Writes are
//! write-behind: the read cache is updated immediately and the physical
//! write is debounced so a burst of mutations costs one host write. When
//! the host reports that it is full, the gateway asks its registered
//! [`QuotaRelief`] (the task store) to purge expired deletions and retries
//! exactly once before reporting [`Error::StorageFull`].

use crate::error::{Error, Result};
use crate::persistence::host::{entry_size, HostError, KeyValueHost};
use crate::tasks::models::Envelope;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Default host key under which the envelope is stored.
pub const DEFAULT_ENVELOPE_KEY: &str = "tasksync.tasks";

/// Tuning for a [`PersistenceGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayOptions {
    /// Host key for the envelope.
    pub key: String,
    /// How long after the first unflushed write the physical write happens.
    pub debounce: Duration,
    /// How long a cached read stays fresh.
    pub cache_ttl: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            key: DEFAULT_ENVELOPE_KEY.to_string(),
            debounce: Duration::from_millis(100),
            cache_ttl: Duration::from_secs(3),
        }
    }
}

/// Something that can free space by dropping purgeable data.
pub trait QuotaRelief: Send + Sync {
    /// Free what can be freed and return how many records were removed.
    ///
    /// Implementations hand the slimmer envelope back through
    /// [`PersistenceGateway::write`].
    fn relieve(&self) -> usize;
}

/// Best-effort storage accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageStats {
    /// Bytes the host reports as used (or an estimate).
    pub used_bytes: u64,
    /// The host's capacity.
    pub estimated_capacity_bytes: u64,
}

/// Asynchronous storage notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    /// A background write failed. The in-memory state is intact.
    WriteFailed {
        /// Human-readable reason.
        message: String,
    },
    /// A write succeeded only after purging expired deletions.
    Recovered {
        /// Number of tasks purged to make room.
        purged: usize,
    },
}

#[derive(Debug)]
struct CachedEnvelope {
    envelope: Envelope,
    cached_at: Instant,
}

#[derive(Debug, Default)]
struct GatewayState {
    cache: Option<CachedEnvelope>,
    pending: Option<Envelope>,
    flush_scheduled: bool,
    // Set when the last physical write failed, so the host copy is stale.
    unsynced: bool,
}

/// Write-behind, quota-aware access to the persisted envelope.
pub struct PersistenceGateway {
    host: Arc<dyn KeyValueHost>,
    options: GatewayOptions,
    state: Mutex<GatewayState>,
    relief: Mutex<Option<Weak<dyn QuotaRelief>>>,
    events: broadcast::Sender<StorageEvent>,
    // Serializes physical writes between the debounce task and explicit flushes.
    write_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for PersistenceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceGateway").field("options", &self.options).finish_non_exhaustive()
    }
}

impl PersistenceGateway {
    /// Create a gateway over `host`.
    #[must_use]
    pub fn new(host: Arc<dyn KeyValueHost>, options: GatewayOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            host,
            options,
            state: Mutex::new(GatewayState::default()),
            relief: Mutex::new(None),
            events,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The gateway's options.
    #[must_use]
    pub const fn options(&self) -> &GatewayOptions {
        &self.options
    }

    /// Register the component that can free space on quota errors.
    pub fn set_relief(&self, relief: Weak<dyn QuotaRelief>) {
        *self.relief.lock() = Some(relief);
    }

    /// Subscribe to asynchronous storage notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    /// Whether a write is waiting to reach the host store.
    #[must_use]
    pub fn has_pending_write(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Read the current envelope.
    ///
    /// Returns the cached copy while it is fresh or while it holds changes
    /// the host has not seen yet. A corrupted host copy is logged and
    /// replaced by an empty envelope.
    ///
    /// # Errors
    ///
    /// Returns an error only if the host store itself cannot be reached.
    #[instrument(skip(self), fields(key = %self.options.key))]
    pub async fn read(&self) -> Result<Envelope> {
        {
            let state = self.state.lock();
            if let Some(cached) = &state.cache {
                let fresh = cached.cached_at.elapsed() < self.options.cache_ttl;
                if fresh || state.pending.is_some() || state.unsynced {
                    debug!(fresh, "serving envelope from cache");
                    return Ok(cached.envelope.clone());
                }
            }
        }

        let envelope = self.read_fresh().await?;

        let mut state = self.state.lock();
        // A write may have landed in the cache while the host read was in flight.
        if state.pending.is_some() || state.unsynced {
            if let Some(cached) = &state.cache {
                return Ok(cached.envelope.clone());
            }
        }
        state.cache =
            Some(CachedEnvelope { envelope: envelope.clone(), cached_at: Instant::now() });
        Ok(envelope)
    }

    async fn read_fresh(&self) -> Result<Envelope> {
        let Some(raw) = self.host.get(&self.options.key).await? else {
            debug!("no persisted envelope; starting empty");
            return Ok(Envelope::empty(Utc::now()));
        };

        match decode_envelope(&raw) {
            Ok(envelope) => {
                debug!(tasks = envelope.tasks.len(), bytes = raw.len(), "loaded envelope");
                Ok(envelope)
            }
            Err(err) => {
                warn!(
                    error = %err,
                    bytes = raw.len(),
                    "persisted envelope is corrupted; starting empty"
                );
                Ok(Envelope::empty(Utc::now()))
            }
        }
    }

    /// Replace the envelope.
    ///
    /// The cache is updated immediately; the physical write happens one
    /// debounce interval after the first unflushed write, carrying whatever
    /// envelope is newest at that point. Without a Tokio runtime the write
    /// stays pending until [`flush`](Self::flush) is called.
    pub fn write(self: &Arc<Self>, envelope: Envelope) {
        let schedule = {
            let mut state = self.state.lock();
            state.cache =
                Some(CachedEnvelope { envelope: envelope.clone(), cached_at: Instant::now() });
            state.pending = Some(envelope);
            if state.flush_scheduled {
                false
            } else {
                state.flush_scheduled = true;
                true
            }
        };

        if schedule {
            self.schedule_flush();
        }
    }

    fn schedule_flush(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no async runtime; write stays pending until flush");
            self.state.lock().flush_scheduled = false;
            return;
        };

        let gateway = Arc::clone(self);
        handle.spawn(async move {
            tokio::time::sleep(gateway.options.debounce).await;
            if let Err(err) = gateway.flush().await {
                error!(error = %err, "debounced write failed");
                let _ = gateway.events.send(StorageEvent::WriteFailed { message: err.to_string() });
            }
        });
    }

    /// Write any pending envelope to the host store now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageFull`] if the host is still full after one
    /// purge-and-retry round, or the host error if the store is unreachable.
    /// Either way the envelope stays pending, so a later flush tries again.
    #[instrument(skip(self), fields(key = %self.options.key))]
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let pending = {
            let mut state = self.state.lock();
            state.flush_scheduled = false;
            state.pending.take()
        };
        let Some(envelope) = pending else {
            return Ok(());
        };
        self.persist(envelope).await
    }

    async fn persist(&self, envelope: Envelope) -> Result<()> {
        let raw = serde_json::to_string(&envelope)?;
        match self.host.set(&self.options.key, &raw).await {
            Ok(()) => {
                self.mark_synced();
                debug!(tasks = envelope.tasks.len(), bytes = raw.len(), "envelope written");
                Ok(())
            }
            Err(HostError::QuotaExceeded { needed, capacity }) => {
                warn!(needed, capacity, "host store full; purging expired deletions and retrying");
                self.retry_after_relief(envelope, &raw, capacity).await
            }
            Err(err) => {
                self.requeue(envelope);
                Err(err.into())
            }
        }
    }

    async fn retry_after_relief(&self, envelope: Envelope, raw: &str, capacity: u64) -> Result<()> {
        let purged = self.relieve();
        // Relief hands back a slimmer envelope through `write`; prefer it.
        let newer = self.state.lock().pending.take();
        match newer {
            Some(retry) => self.retry_write(retry, purged).await,
            None if purged > 0 => self.retry_write(envelope, purged).await,
            None => Err(self.still_full(envelope, raw, purged, capacity)),
        }
    }

    async fn retry_write(&self, envelope: Envelope, purged: usize) -> Result<()> {
        let raw = serde_json::to_string(&envelope)?;
        match self.host.set(&self.options.key, &raw).await {
            Ok(()) => {
                self.mark_synced();
                info!(purged, bytes = raw.len(), "envelope written after quota recovery");
                let _ = self.events.send(StorageEvent::Recovered { purged });
                Ok(())
            }
            Err(HostError::QuotaExceeded { capacity, .. }) => {
                Err(self.still_full(envelope, &raw, purged, capacity))
            }
            Err(err) => {
                self.requeue(envelope);
                Err(err.into())
            }
        }
    }

    fn still_full(&self, envelope: Envelope, raw: &str, purged: usize, capacity: u64) -> Error {
        error!(purged, capacity, "host store still full after recovery");
        self.requeue(envelope);
        Error::StorageFull {
            attempted_bytes: entry_size(&self.options.key, raw),
            capacity_bytes: capacity,
        }
    }

    // The host never saw `envelope`; keep it for the next flush unless a
    // newer write already took its place.
    fn requeue(&self, envelope: Envelope) {
        let mut state = self.state.lock();
        if state.pending.is_none() {
            state.pending = Some(envelope);
        }
        state.unsynced = true;
    }

    fn relieve(&self) -> usize {
        let relief = self.relief.lock().as_ref().and_then(Weak::upgrade);
        relief.map_or(0, |relief| relief.relieve())
    }

    fn mark_synced(&self) {
        self.state.lock().unsynced = false;
    }

    /// Report how much of the host store is in use.
    ///
    /// Never fails: if the host cannot report usage, the size of the cached
    /// envelope is used as an estimate.
    pub async fn usage_stats(&self) -> UsageStats {
        let estimated_capacity_bytes = self.host.capacity_bytes();
        let used_bytes = match self.host.used_bytes().await {
            Ok(used) => used,
            Err(err) => {
                debug!(error = %err, "usage unavailable from host; estimating from cache");
                self.estimate_cached_bytes()
            }
        };
        UsageStats { used_bytes, estimated_capacity_bytes }
    }

    fn estimate_cached_bytes(&self) -> u64 {
        let state = self.state.lock();
        state
            .cache
            .as_ref()
            .and_then(|cached| serde_json::to_string(&cached.envelope).ok())
            .map_or(0, |raw| entry_size(&self.options.key, &raw))
    }
}

/// Decode and structurally validate a persisted envelope.
///
/// # Errors
///
/// Returns [`Error::CorruptedState`] if the text is not a valid envelope.
pub fn decode_envelope(raw: &str) -> Result<Envelope> {
    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|e| Error::CorruptedState(e.to_string()))?;
    envelope.check().map_err(Error::CorruptedState)?;
    Ok(envelope)
}
