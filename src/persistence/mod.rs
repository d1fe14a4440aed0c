//! Durable storage for the task envelope.
//!
//! [`KeyValueHost`] abstracts the host's capacity-limited string store
//! ([`MemoryHost`] in-process, [`SqliteHost`] on disk). The
//! [`PersistenceGateway`] sits on top of it and owns caching, debounced
//! writes and quota recovery.

pub mod gateway;
pub mod host;
pub mod sqlite;

pub use gateway::{
    decode_envelope, GatewayOptions, PersistenceGateway, QuotaRelief, StorageEvent, UsageStats,
    DEFAULT_ENVELOPE_KEY,
};
pub use host::{HostError, KeyValueHost, MemoryHost, DEFAULT_CAPACITY_BYTES};
pub use sqlite::{SqliteHost, DATABASE_FILENAME};
