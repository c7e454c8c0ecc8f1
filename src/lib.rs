//! # Casework - concurrent execution engine for a legal assistant backend
//!
//! Casework pairs a bounded, priority-scheduled worker pool with an
//! adaptive result cache. Expensive operations (document extraction,
//! case-law search, model completions, filing validation) run on
//! isolated workers fed by a single coordinator; their results are
//! cached under a normalized fingerprint so that repeated or merely
//! similar requests are answered without doing the work again.
//!
//! ## Features
//!
//! - **Bounded priority scheduling**: higher priority dispatches first,
//!   submission order breaks ties, and a full queue rejects immediately
//!   instead of growing without limit
//! - **Crash recovery**: a worker that dies abnormally is recreated
//!   under the same id while the rest of the pool keeps serving
//! - **Adaptive caching**: exact fingerprint match plus token-overlap
//!   similarity, so a differently phrased question can reuse an answer
//! - **Per-category TTLs**: validation results age out in a day while
//!   case-law lookups survive a month, with strict LRU eviction on top
//! - **Snapshot persistence**: the whole cache writes to a flat JSON
//!   file and survives a restart
//!
//! The pool stays agnostic of payloads; the [`engine`] module maps the
//! legal operation kinds to categories, priorities and TTL policies.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod logging;
pub mod pool;

// Prelude module for common imports
pub mod prelude;

// Re-export commonly used types
pub use cache::{CacheQuery, CacheStats, CategoryStats, ResultCache};
pub use config::{CacheConfig, EngineConfig, PoolConfig, default_worker_count};
pub use engine::{Engine, EngineStats, Operation};
pub use error::{CacheError, ConfigError, EngineError, PoolError};
pub use executor::TaskExecutor;
pub use pool::{PoolStats, TaskHandle, TaskId, WorkerId, WorkerPool, WorkerStats};

/// Version of the casework crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
