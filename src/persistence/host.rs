//! Host key-value store abstraction.
//!
//! The host store is the per-origin string store the tracker persists into.
//! It has a hard byte ceiling; exceeding it is reported as
//! [`HostError::QuotaExceeded`] so the gateway can recover.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Default per-origin ceiling (5 MiB), matching common browser quotas.
pub const DEFAULT_CAPACITY_BYTES: u64 = 5 * 1024 * 1024;

/// Failures reported by a host key-value store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// The write would push the store past its capacity.
    #[error("quota exceeded: {needed} bytes needed, {capacity} available in total")]
    QuotaExceeded {
        /// Total bytes the store would hold after the write.
        needed: u64,
        /// The store's capacity.
        capacity: u64,
    },

    /// The store could not be reached or failed internally.
    #[error("host store unavailable: {0}")]
    Unavailable(String),
}

/// Trait for the host's key-value store.
///
/// Sizes are counted as key bytes plus value bytes.
#[async_trait]
pub trait KeyValueHost: Send + Sync {
    /// Read the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, HostError>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> Result<(), HostError>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), HostError>;

    /// Bytes currently in use across all keys.
    async fn used_bytes(&self) -> Result<u64, HostError>;

    /// The store's byte ceiling.
    fn capacity_bytes(&self) -> u64;
}

/// Size a key-value pair occupies in a host store.
#[must_use]
pub fn entry_size(key: &str, value: &str) -> u64 {
    (key.len() + value.len()) as u64
}

/// An in-process host store with a byte ceiling.
///
/// Failures can be injected to exercise recovery paths.
#[derive(Debug)]
pub struct MemoryHost {
    entries: Mutex<BTreeMap<String, String>>,
    capacity: Mutex<u64>,
    unavailable: Mutex<bool>,
    writes: Mutex<usize>,
    attempts: Mutex<usize>,
}

impl MemoryHost {
    /// Create an empty store with the given capacity.
    #[must_use]
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            capacity: Mutex::new(capacity),
            unavailable: Mutex::new(false),
            writes: Mutex::new(0),
            attempts: Mutex::new(0),
        }
    }

    /// Change the capacity (applies to subsequent writes).
    pub fn set_capacity(&self, capacity: u64) {
        *self.capacity.lock() = capacity;
    }

    /// Make every operation fail with [`HostError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    /// Overwrite a raw value without any checks.
    pub fn put_raw(&self, key: &str, value: &str) {
        self.entries.lock().insert(key.to_string(), value.to_string());
    }

    /// Read a raw value without any checks.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    /// Number of successful `set` calls so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        *self.writes.lock()
    }

    /// Number of `set` calls so far, including rejected ones.
    #[must_use]
    pub fn set_attempts(&self) -> usize {
        *self.attempts.lock()
    }

    fn check_available(&self) -> Result<(), HostError> {
        if *self.unavailable.lock() {
            return Err(HostError::Unavailable("memory host switched off".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY_BYTES)
    }
}

#[async_trait]
impl KeyValueHost for MemoryHost {
    async fn get(&self, key: &str) -> Result<Option<String>, HostError> {
        self.check_available()?;
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), HostError> {
        *self.attempts.lock() += 1;
        self.check_available()?;
        let capacity = *self.capacity.lock();
        let mut entries = self.entries.lock();

        let others: u64 =
            entries.iter().filter(|(k, _)| k.as_str() != key).map(|(k, v)| entry_size(k, v)).sum();
        let needed = others + entry_size(key, value);
        if needed > capacity {
            return Err(HostError::QuotaExceeded { needed, capacity });
        }

        entries.insert(key.to_string(), value.to_string());
        *self.writes.lock() += 1;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), HostError> {
        self.check_available()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn used_bytes(&self) -> Result<u64, HostError> {
        self.check_available()?;
        Ok(self.entries.lock().iter().map(|(k, v)| entry_size(k, v)).sum())
    }

    fn capacity_bytes(&self) -> u64 {
        *self.capacity.lock()
    }
}
