//! Task management.
//!
//! This module provides the local task collection:
//! - Tasks with text, completion state and soft deletion
//! - Validation of task text
//! - The [`TaskStore`], the only mutation surface, which persists through
//!   a [`PersistenceGateway`](crate::persistence::PersistenceGateway)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tasksync::clock::SystemClock;
//! use tasksync::persistence::{GatewayOptions, MemoryHost, PersistenceGateway};
//! use tasksync::tasks::{StoreOptions, TaskPatch, TaskStore};
//!
//! # async fn demo() -> tasksync::Result<()> {
//! let host = Arc::new(MemoryHost::default());
//! let gateway = PersistenceGateway::new(host, GatewayOptions::default());
//! let store = TaskStore::open(gateway, Arc::new(SystemClock), StoreOptions::default()).await?;
//!
//! let task = store.create("Buy milk")?;
//! store.update(&task.id, TaskPatch::completed(true))?;
//! store.delete(&task.id)?;
//! store.restore(&task.id)?;
//! store.flush().await?;
//! # Ok(())
//! # }
//! ```

pub mod id;
pub mod models;
pub mod store;
pub mod validation;

pub use models::{Envelope, Origin, Task, TaskEvent, TaskEventKind, TaskPatch, SCHEMA_VERSION};
pub use store::{StoreOptions, TaskStore, DEFAULT_RETENTION_DAYS};
pub use validation::{validate_text, ValidationError, MAX_TEXT_CHARS};
