//! # `tasksync`
//!
//! A local-first task tracker: a validated task store, a capacity-aware
//! persistence gateway over a host key-value store, and an offline sync
//! engine that reconciles with a versioned remote service.

#[cfg(feature = "cli")]
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod persistence;
pub mod sync;
pub mod tasks;
pub mod testing;

pub use error::{Error, Result};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
