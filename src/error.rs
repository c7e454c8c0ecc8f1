//! Error types for the pool, cache, and engine surfaces.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::pool::WorkerId;

/// Errors surfaced by pool operations and task handles.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Submission rejected synchronously because the backlog is at capacity
    #[error("Task queue is full: capacity {capacity} reached")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The worker executing the task exited abnormally
    #[error("{worker} crashed while executing the task")]
    WorkerCrashed {
        /// Identifier of the crashed worker.
        worker: WorkerId,
    },

    /// The worker ran the task and reported a domain-level failure
    #[error("Task execution failed: {message}")]
    ExecutionFailed {
        /// Failure description, including the cause chain.
        message: String,
    },

    /// The task was removed from the queue before dispatch
    #[error("Task was cancelled before dispatch")]
    Cancelled,

    /// A wait deadline elapsed with outstanding work
    #[error("Timed out after {waited:?} with outstanding work")]
    Timeout {
        /// How long the caller waited.
        waited: Duration,
    },

    /// The pool has shut down and no longer accepts operations
    #[error("Worker pool is shut down")]
    Closed,
}

/// Errors from reading or writing the persisted cache snapshot.
///
/// The engine treats these as degradations (cold start on load, skipped
/// write on save); the cache API itself returns them to the caller.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Save or load was called without a configured snapshot path
    #[error("No snapshot path configured")]
    SnapshotPathMissing,

    /// The snapshot could not be serialized
    #[error("Failed to serialize cache snapshot")]
    SnapshotSerialize(#[source] serde_json::Error),

    /// The snapshot file exists but is not a valid snapshot
    #[error("Malformed cache snapshot at {path}")]
    SnapshotParse {
        /// Location of the malformed file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// The snapshot file could not be read
    #[error("Failed to read cache snapshot at {path}")]
    SnapshotRead {
        /// Location that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The snapshot file could not be written
    #[error("Failed to write cache snapshot at {path}")]
    SnapshotWrite {
        /// Location that was written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Configuration validation and loading errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Pool must have at least one worker
    #[error("Worker count must be positive")]
    ZeroWorkers,

    /// Queue capacity must allow at least one task
    #[error("Queue capacity must be positive")]
    ZeroQueueCapacity,

    /// Cache capacity must allow at least one entry
    #[error("Cache capacity must be positive")]
    ZeroCacheCapacity,

    /// Similarity threshold outside the valid range
    #[error("Similarity threshold must be within [0.0, 1.0], got {value}")]
    ThresholdOutOfRange {
        /// The rejected value.
        value: f64,
    },

    /// Configuration file could not be read
    #[error("Failed to read config: {0}")]
    Io(String),

    /// Configuration file is not valid YAML for this schema
    #[error("Failed to parse config: {0}")]
    Parse(String),
}

/// Errors surfaced by the orchestration engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid configuration at construction
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Failure from the worker pool or a task handle
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Failure from an explicit cache snapshot operation
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::QueueFull { capacity: 1000 };
        assert_eq!(err.to_string(), "Task queue is full: capacity 1000 reached");

        let err = PoolError::WorkerCrashed { worker: WorkerId(3) };
        assert_eq!(err.to_string(), "worker-3 crashed while executing the task");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::ThresholdOutOfRange { value: 1.5 };
        assert_eq!(
            err.to_string(),
            "Similarity threshold must be within [0.0, 1.0], got 1.5"
        );
    }

    #[test]
    fn test_engine_error_wraps_pool_error() {
        let err = EngineError::from(PoolError::Cancelled);
        assert_eq!(err.to_string(), "Task was cancelled before dispatch");
    }
}
