//! Offline synchronization with a versioned remote task service.
//!
//! - [`queue`]: the persisted outbox of local mutations.
//! - [`remote`]: the contract the remote service implements.
//! - [`engine`]: replay, pull, conflict handling and the periodic loop.
//! - [`conflict`]: conflict records and resolutions.
//! - `http`: an HTTP client for the remote service (feature `http`).

pub mod conflict;
pub mod engine;
#[cfg(feature = "http")]
pub mod http;
pub mod queue;
pub mod remote;

pub use conflict::{last_writer_wins, ConflictRecord, MergeFn, Resolution};
pub use engine::{
    Connectivity, FlushReport, SyncEngine, SyncEvent, SyncOptions, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_SYNC_INTERVAL,
};
#[cfg(feature = "http")]
pub use http::HttpRemote;
pub use queue::{
    OfflineOperation, OperationKind, OperationState, Outbox, OutboxStore, DEFAULT_OUTBOX_KEY,
};
pub use remote::{DetachedRemote, RemoteChanges, RemoteError, RemoteTaskService};
