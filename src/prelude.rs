//! Prelude module for common imports

pub use crate::cache::{CacheQuery, CacheStats, CategoryStats, ResultCache};
pub use crate::config::{CacheConfig, EngineConfig, PoolConfig, default_worker_count};
pub use crate::engine::{Engine, EngineStats, Operation};
pub use crate::error::{CacheError, ConfigError, EngineError, PoolError};
pub use crate::executor::TaskExecutor;
pub use crate::pool::{PoolStats, TaskHandle, TaskId, WorkerId, WorkerPool, WorkerStats};
