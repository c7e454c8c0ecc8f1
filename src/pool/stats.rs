//! Pool statistics snapshots.

use serde::Serialize;

use crate::pool::{TaskId, WorkerId};

/// Point-in-time counters for one worker instance.
///
/// Counters belong to the current instance: a worker recreated after a
/// crash starts over at zero while pool-level counters are preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Stable worker identifier.
    pub id: WorkerId,
    /// Whether a task is currently executing.
    pub busy: bool,
    /// Task being executed, if any.
    pub current_task: Option<TaskId>,
    /// Tasks this instance completed successfully.
    pub tasks_completed: u64,
    /// Wall-clock execution time accumulated by this instance.
    pub cumulative_processing_ms: u64,
}

/// Point-in-time view of the whole pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    /// Live workers.
    pub workers_total: usize,
    /// Workers currently executing a task.
    pub workers_busy: usize,
    /// Workers waiting for work.
    pub workers_idle: usize,
    /// Busy share of the pool, 0 to 100.
    pub utilization_pct: f64,
    /// Tasks waiting for dispatch.
    pub queue_depth: usize,
    /// Accepted submissions since the pool started.
    pub submitted: u64,
    /// Tasks that finished successfully.
    pub completed: u64,
    /// Tasks that failed, were cancelled, or died with a worker.
    pub failed: u64,
    /// Tasks claimed by a worker but not yet finished.
    pub in_flight: usize,
    /// Running average execution time over executed tasks.
    pub avg_task_duration_ms: f64,
    /// Successful completions per second of pool uptime.
    pub throughput_per_sec: f64,
    /// Seconds since the pool started.
    pub uptime_secs: f64,
    /// Per-worker counters, ordered by worker id.
    pub workers: Vec<WorkerStats>,
}

impl PoolStats {
    /// True when the queue is empty and nothing is in flight.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.queue_depth == 0 && self.in_flight == 0
    }

    /// Accounted tasks: every accepted submission is either queued,
    /// in flight, completed, or failed.
    #[must_use]
    pub fn accounted(&self) -> u64 {
        self.completed + self.failed + self.queue_depth as u64 + self.in_flight as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stats_are_quiescent() {
        let stats = PoolStats::default();
        assert!(stats.is_quiescent());
        assert_eq!(stats.accounted(), 0);
    }

    #[test]
    fn test_accounted_sums_every_state() {
        let stats = PoolStats {
            completed: 5,
            failed: 2,
            queue_depth: 3,
            in_flight: 1,
            submitted: 11,
            ..Default::default()
        };
        assert_eq!(stats.accounted(), stats.submitted);
        assert!(!stats.is_quiescent());
    }
}
