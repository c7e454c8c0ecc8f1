//! Task execution traits
//!
//! This module defines the seam between the pool and the work it runs.
//! The pool never inspects payloads; it hands them to an executor inside
//! an isolated worker task and relays the outcome to the caller's handle.

use async_trait::async_trait;

/// Trait for executing task payloads inside pool workers
///
/// One executor instance is shared by every worker, so implementations
/// must be safe to call concurrently. A returned `Err` is a domain-level
/// failure: it fails the task's handle without affecting the worker or
/// the pool.
#[async_trait]
#[allow(clippy::missing_errors_doc)]
pub trait TaskExecutor: Send + Sync + 'static {
    /// Opaque description of one unit of work.
    type Payload: Send + 'static;

    /// Result produced for each payload.
    type Output: Send + 'static;

    /// Executes one payload to completion
    async fn execute(&self, payload: Self::Payload) -> anyhow::Result<Self::Output>;
}
