//! Worker task: isolated execution loop speaking the pool's message
//! protocol. A worker announces itself with `Ready`, executes one task at
//! a time, and reports each outcome with `Result` followed by a fresh
//! `Ready`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;

use crate::executor::TaskExecutor;
use crate::pool::{TaskId, WorkerId};

/// Coordinator to worker messages.
pub(crate) enum WorkerRequest<P> {
    /// Execute one task.
    Task {
        /// Task identifier, echoed back in the result.
        id: TaskId,
        /// Work description for the executor.
        payload: P,
    },
    /// Finish the loop.
    Stop,
}

/// Worker to coordinator messages.
pub(crate) enum WorkerEvent<R> {
    /// The worker is idle and can accept a task.
    Ready {
        /// Sender's identity.
        worker: WorkerId,
    },
    /// A task finished, successfully or not.
    Result {
        /// Sender's identity.
        worker: WorkerId,
        /// Task the outcome belongs to.
        task: TaskId,
        /// Executor outcome.
        outcome: anyhow::Result<R>,
        /// Wall-clock execution time.
        elapsed: Duration,
    },
}

/// Runs one worker until `Stop` arrives or a channel closes.
pub(crate) async fn run_worker<E: TaskExecutor>(
    id: WorkerId,
    executor: Arc<E>,
    mut requests: mpsc::Receiver<WorkerRequest<E::Payload>>,
    events: mpsc::Sender<WorkerEvent<E::Output>>,
) {
    debug!(worker = %id, "worker started");
    if events.send(WorkerEvent::Ready { worker: id }).await.is_err() {
        return;
    }

    while let Some(request) = requests.recv().await {
        match request {
            WorkerRequest::Task { id: task, payload } => {
                let started = Instant::now();
                let outcome = executor.execute(payload).await;
                let event = WorkerEvent::Result {
                    worker: id,
                    task,
                    outcome,
                    elapsed: started.elapsed(),
                };
                if events.send(event).await.is_err() {
                    return;
                }
                if events.send(WorkerEvent::Ready { worker: id }).await.is_err() {
                    return;
                }
            }
            WorkerRequest::Stop => break,
        }
    }

    debug!(worker = %id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct DoubleExecutor;

    #[async_trait]
    impl TaskExecutor for DoubleExecutor {
        type Payload = u32;
        type Output = u32;

        async fn execute(&self, payload: u32) -> anyhow::Result<u32> {
            if payload == 0 {
                anyhow::bail!("zero is not a valid payload");
            }
            Ok(payload * 2)
        }
    }

    #[tokio::test]
    async fn test_worker_protocol_sequence() {
        let (requests_tx, requests_rx) = mpsc::channel(1);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let worker = tokio::spawn(run_worker(
            WorkerId(0),
            Arc::new(DoubleExecutor),
            requests_rx,
            events_tx,
        ));

        // Startup announcement.
        assert!(matches!(
            events_rx.recv().await,
            Some(WorkerEvent::Ready { worker: WorkerId(0) })
        ));

        let task = TaskId::new();
        requests_tx
            .send(WorkerRequest::Task { id: task, payload: 21 })
            .await
            .unwrap();

        match events_rx.recv().await {
            Some(WorkerEvent::Result { task: done, outcome, .. }) => {
                assert_eq!(done, task);
                assert_eq!(outcome.unwrap(), 42);
            }
            other => panic!("expected a result event, got {}", event_name(other.as_ref())),
        }
        assert!(matches!(
            events_rx.recv().await,
            Some(WorkerEvent::Ready { .. })
        ));

        requests_tx.send(WorkerRequest::Stop).await.unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_reports_execution_failure() {
        let (requests_tx, requests_rx) = mpsc::channel(1);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        tokio::spawn(run_worker(
            WorkerId(1),
            Arc::new(DoubleExecutor),
            requests_rx,
            events_tx,
        ));

        let _ready = events_rx.recv().await;
        requests_tx
            .send(WorkerRequest::Task { id: TaskId::new(), payload: 0 })
            .await
            .unwrap();

        match events_rx.recv().await {
            Some(WorkerEvent::Result { outcome, .. }) => {
                assert!(outcome.unwrap_err().to_string().contains("zero"));
            }
            other => panic!("expected a result event, got {}", event_name(other.as_ref())),
        }
    }

    fn event_name(event: Option<&WorkerEvent<u32>>) -> &'static str {
        match event {
            Some(WorkerEvent::Ready { .. }) => "ready",
            Some(WorkerEvent::Result { .. }) => "result",
            None => "closed channel",
        }
    }
}
