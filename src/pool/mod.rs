//! Bounded worker pool with priority scheduling.
//!
//! One coordinator task owns the queue, the worker table, and the
//! in-flight map; the [`WorkerPool`] handle talks to it over a command
//! channel, so every piece of bookkeeping is mutated by a single logical
//! thread of control and needs no locks. Workers are isolated tasks that
//! receive payloads and send outcomes back by message passing.
//!
//! Dispatch is greedy and non-preemptive: whenever a worker is idle and
//! the queue is non-empty, the head (highest priority, earliest
//! submission among ties) goes to that worker. There is no work stealing
//! and no priority aging, so a continuous stream of high-priority
//! submissions can starve low-priority ones.
//!
//! A worker that exits abnormally is recreated with the same id after a
//! configurable delay; whatever task it was running fails its handle with
//! [`PoolError::WorkerCrashed`] rather than being resubmitted, since the
//! work may not be idempotent.

mod queue;
mod stats;
mod worker;

pub use stats::{PoolStats, WorkerStats};

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::task::JoinMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::{ConfigError, PoolError};
use crate::executor::TaskExecutor;
use queue::{PendingTask, TaskQueue};
use worker::{WorkerEvent, WorkerRequest, run_worker};

/// Unique task identifier, generated at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker identifier, stable across recreations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Completion handle returned by [`WorkerPool::submit`].
#[derive(Debug)]
pub struct TaskHandle<R> {
    id: TaskId,
    done: oneshot::Receiver<Result<R, PoolError>>,
}

impl<R> TaskHandle<R> {
    /// Identifier assigned to the submitted task.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Waits for the task to finish.
    ///
    /// Resolves to the executor's output, the task's specific failure, or
    /// [`PoolError::Closed`] if the pool died before resolving it.
    pub async fn wait(self) -> Result<R, PoolError> {
        match self.done.await {
            Ok(outcome) => outcome,
            Err(_) => Err(PoolError::Closed),
        }
    }
}

enum Command<E: TaskExecutor> {
    Initialize {
        reply: oneshot::Sender<usize>,
    },
    Submit {
        payload: E::Payload,
        priority: i32,
        done: oneshot::Sender<Result<E::Output, PoolError>>,
        reply: oneshot::Sender<Result<TaskId, PoolError>>,
    },
    ClearQueue {
        reply: oneshot::Sender<usize>,
    },
    Statistics {
        reply: oneshot::Sender<PoolStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Respawn {
        worker: WorkerId,
    },
}

/// Handle to a pool of isolated workers fed by a priority queue.
///
/// Cheap to clone and share; all clones talk to the same coordinator.
/// Must be created from within a Tokio runtime.
pub struct WorkerPool<E: TaskExecutor> {
    commands: mpsc::UnboundedSender<Command<E>>,
    stats: watch::Receiver<PoolStats>,
    config: PoolConfig,
}

impl<E: TaskExecutor> Clone for WorkerPool<E> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            stats: self.stats.clone(),
            config: self.config.clone(),
        }
    }
}

impl<E: TaskExecutor> WorkerPool<E> {
    /// Validates the configuration and spawns the coordinator task.
    ///
    /// No workers exist until [`initialize`](Self::initialize) runs;
    /// submissions queue up in the meantime.
    pub fn new(executor: E, config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(PoolStats::default());
        let coordinator = Coordinator::new(
            Arc::new(executor),
            config.clone(),
            commands.clone(),
            command_rx,
            stats_tx,
        );
        tokio::spawn(coordinator.run());
        Ok(Self {
            commands,
            stats: stats_rx,
            config,
        })
    }

    /// Creates the configured number of workers.
    ///
    /// Idempotent: a repeat call logs a warning and returns the live
    /// worker count unchanged.
    pub async fn initialize(&self) -> Result<usize, PoolError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Initialize { reply })
            .map_err(|_| PoolError::Closed)?;
        response.await.map_err(|_| PoolError::Closed)
    }

    /// Submits one payload; the handle resolves when the task finishes.
    ///
    /// Fails with [`PoolError::QueueFull`] when the backlog is at
    /// capacity, without touching the queue.
    pub async fn submit(
        &self,
        payload: E::Payload,
        priority: i32,
    ) -> Result<TaskHandle<E::Output>, PoolError> {
        let (done, done_rx) = oneshot::channel();
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Submit {
                payload,
                priority,
                done,
                reply,
            })
            .map_err(|_| PoolError::Closed)?;
        let id = response.await.map_err(|_| PoolError::Closed)??;
        Ok(TaskHandle { id, done: done_rx })
    }

    /// Submits every payload and waits for all of them.
    ///
    /// Results come back in submission order. `on_progress` runs after
    /// each individual completion with `(completed, total)`; a submission
    /// rejected at the queue counts as completed.
    pub async fn process_batch<F>(
        &self,
        payloads: Vec<E::Payload>,
        priority: i32,
        mut on_progress: F,
    ) -> Vec<Result<E::Output, PoolError>>
    where
        F: FnMut(usize, usize) + Send,
    {
        let total = payloads.len();
        let mut results: Vec<Option<Result<E::Output, PoolError>>> = Vec::with_capacity(total);
        results.resize_with(total, || None);

        let mut completed = 0usize;
        let mut waits = FuturesUnordered::new();
        for (index, payload) in payloads.into_iter().enumerate() {
            match self.submit(payload, priority).await {
                Ok(handle) => waits.push(async move { (index, handle.wait().await) }),
                Err(err) => {
                    results[index] = Some(Err(err));
                    completed += 1;
                    on_progress(completed, total);
                }
            }
        }
        while let Some((index, outcome)) = waits.next().await {
            results[index] = Some(outcome);
            completed += 1;
            on_progress(completed, total);
        }

        results
            .into_iter()
            .map(|slot| slot.unwrap_or(Err(PoolError::Closed)))
            .collect()
    }

    /// Returns a point-in-time statistics snapshot.
    pub async fn statistics(&self) -> Result<PoolStats, PoolError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Statistics { reply })
            .map_err(|_| PoolError::Closed)?;
        response.await.map_err(|_| PoolError::Closed)
    }

    /// Subscribes to pushed statistics updates.
    ///
    /// The receiver observes a fresh snapshot after every state change;
    /// dropping it unsubscribes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PoolStats> {
        self.stats.clone()
    }

    /// Fails every queued task with [`PoolError::Cancelled`].
    ///
    /// In-flight tasks are unaffected. Returns how many were cancelled.
    pub async fn clear_queue(&self) -> Result<usize, PoolError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::ClearQueue { reply })
            .map_err(|_| PoolError::Closed)?;
        response.await.map_err(|_| PoolError::Closed)
    }

    /// Resolves once the queue is empty and nothing is in flight.
    ///
    /// Polls at the configured cadence and fails with
    /// [`PoolError::Timeout`] when the deadline passes first.
    pub async fn wait_for_completion(&self, timeout: Duration) -> Result<(), PoolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut ticker = tokio::time::interval(self.config.completion_poll_interval);
        loop {
            if self.statistics().await?.is_quiescent() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PoolError::Timeout { waited: timeout });
            }
            ticker.tick().await;
        }
    }

    /// Stops accepting submissions, drains briefly, then stops the
    /// workers.
    ///
    /// Queued tasks fail with [`PoolError::Cancelled`]; tasks still
    /// running when the grace period passes fail with
    /// [`PoolError::WorkerCrashed`]. Idempotent: shutting down an already
    /// stopped pool succeeds.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { reply })
            .is_err()
        {
            return Ok(());
        }
        response.await.map_err(|_| PoolError::Closed)
    }
}

struct WorkerSlot<P> {
    requests: mpsc::Sender<WorkerRequest<P>>,
    busy: bool,
    current: Option<TaskId>,
    tasks_completed: u64,
    processing: Duration,
}

struct InFlight<R> {
    worker: WorkerId,
    done: oneshot::Sender<Result<R, PoolError>>,
}

struct Coordinator<E: TaskExecutor> {
    executor: Arc<E>,
    config: PoolConfig,
    self_commands: mpsc::UnboundedSender<Command<E>>,
    commands: mpsc::UnboundedReceiver<Command<E>>,
    events_tx: mpsc::Sender<WorkerEvent<E::Output>>,
    events: mpsc::Receiver<WorkerEvent<E::Output>>,
    queue: TaskQueue<E::Payload, E::Output>,
    workers: AHashMap<WorkerId, WorkerSlot<E::Payload>>,
    idle: Vec<WorkerId>,
    in_flight: AHashMap<TaskId, InFlight<E::Output>>,
    tasks: JoinMap<WorkerId, ()>,
    stats_tx: watch::Sender<PoolStats>,
    started_at: Instant,
    initialized: bool,
    draining: bool,
    submitted: u64,
    completed: u64,
    failed: u64,
    executed: u64,
    execution_time: Duration,
}

impl<E: TaskExecutor> Coordinator<E> {
    fn new(
        executor: Arc<E>,
        config: PoolConfig,
        self_commands: mpsc::UnboundedSender<Command<E>>,
        commands: mpsc::UnboundedReceiver<Command<E>>,
        stats_tx: watch::Sender<PoolStats>,
    ) -> Self {
        // Each worker has at most a result and a ready event outstanding,
        // so this capacity means no worker ever blocks on the event
        // channel even while the coordinator is busy elsewhere.
        let (events_tx, events) = mpsc::channel(config.num_workers * 2 + 2);
        let queue = TaskQueue::new(config.max_queue_size);
        Self {
            executor,
            config,
            self_commands,
            commands,
            events_tx,
            events,
            queue,
            workers: AHashMap::new(),
            idle: Vec::new(),
            in_flight: AHashMap::new(),
            tasks: JoinMap::new(),
            stats_tx,
            started_at: Instant::now(),
            initialized: false,
            draining: false,
            submitted: 0,
            completed: 0,
            failed: 0,
            executed: 0,
            execution_time: Duration::ZERO,
        }
    }

    async fn run(mut self) {
        debug!("pool coordinator started");
        loop {
            tokio::select! {
                maybe = self.commands.recv() => {
                    match maybe {
                        Some(command) => {
                            if let Some(reply) = self.handle_command(command) {
                                self.drain(vec![reply]).await;
                                return;
                            }
                        }
                        None => {
                            debug!("all pool handles dropped; draining");
                            self.drain(Vec::new()).await;
                            return;
                        }
                    }
                }
                Some(event) = self.events.recv() => self.handle_event(event),
                Some((worker, joined)) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.handle_worker_exit(worker, &joined);
                }
            }
            self.publish_stats();
        }
    }

    /// Returns the shutdown reply sender when a shutdown was requested.
    fn handle_command(&mut self, command: Command<E>) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Initialize { reply } => {
                let count = self.initialize_workers();
                let _ = reply.send(count);
            }
            Command::Submit {
                payload,
                priority,
                done,
                reply,
            } => {
                if self.queue.is_full() {
                    warn!(
                        capacity = self.config.max_queue_size,
                        "submission rejected: queue full"
                    );
                    let _ = reply.send(Err(PoolError::QueueFull {
                        capacity: self.config.max_queue_size,
                    }));
                    return None;
                }
                let id = TaskId::new();
                self.submitted += 1;
                self.queue.push(id, payload, priority, done);
                debug!(task = %id, priority, depth = self.queue.len(), "task queued");
                let _ = reply.send(Ok(id));
                self.dispatch_ready();
            }
            Command::ClearQueue { reply } => {
                let cancelled = self.cancel_queued();
                info!(cancelled, "task queue cleared");
                let _ = reply.send(cancelled);
            }
            Command::Statistics { reply } => {
                let _ = reply.send(self.stats_snapshot());
            }
            Command::Respawn { worker } => self.spawn_worker(worker),
            Command::Shutdown { reply } => return Some(reply),
        }
        None
    }

    fn initialize_workers(&mut self) -> usize {
        if self.initialized {
            warn!(workers = self.workers.len(), "pool already initialized");
            return self.workers.len();
        }
        self.initialized = true;
        for index in 0..self.config.num_workers {
            self.spawn_worker(WorkerId(index));
        }
        info!(
            workers = self.workers.len(),
            queue_capacity = self.config.max_queue_size,
            "worker pool initialized"
        );
        self.workers.len()
    }

    fn spawn_worker(&mut self, id: WorkerId) {
        if self.draining {
            return;
        }
        let (requests, request_rx) = mpsc::channel(1);
        self.tasks.spawn(
            id,
            run_worker(id, Arc::clone(&self.executor), request_rx, self.events_tx.clone()),
        );
        self.workers.insert(
            id,
            WorkerSlot {
                requests,
                busy: false,
                current: None,
                tasks_completed: 0,
                processing: Duration::ZERO,
            },
        );
        debug!(worker = %id, "worker spawned");
    }

    fn handle_event(&mut self, event: WorkerEvent<E::Output>) {
        match event {
            WorkerEvent::Ready { worker } => {
                if self.workers.contains_key(&worker) {
                    if !self.idle.contains(&worker) {
                        self.idle.push(worker);
                    }
                    self.dispatch_ready();
                }
            }
            WorkerEvent::Result {
                worker,
                task,
                outcome,
                elapsed,
            } => {
                // A result frees the worker slot even when the task is
                // no longer tracked.
                if let Some(slot) = self.workers.get_mut(&worker) {
                    slot.busy = false;
                    slot.current = None;
                    slot.processing += elapsed;
                }
                let Some(entry) = self.in_flight.remove(&task) else {
                    debug!(task = %task, "dropping result for an unknown task");
                    return;
                };
                self.executed += 1;
                self.execution_time += elapsed;
                match outcome {
                    Ok(output) => {
                        self.completed += 1;
                        if let Some(slot) = self.workers.get_mut(&worker) {
                            slot.tasks_completed += 1;
                        }
                        debug!(
                            task = %task,
                            worker = %worker,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "task completed"
                        );
                        let _ = entry.done.send(Ok(output));
                    }
                    Err(err) => {
                        self.failed += 1;
                        let message = format!("{err:#}");
                        warn!(task = %task, worker = %worker, error = %message, "task failed");
                        let _ = entry
                            .done
                            .send(Err(PoolError::ExecutionFailed { message }));
                    }
                }
            }
        }
    }

    fn dispatch_ready(&mut self) {
        while !self.idle.is_empty() && !self.queue.is_empty() {
            if let (Some(worker), Some(task)) = (self.idle.pop(), self.queue.pop()) {
                self.dispatch(worker, task);
            }
        }
    }

    fn dispatch(&mut self, worker: WorkerId, task: PendingTask<E::Payload, E::Output>) {
        let Some(slot) = self.workers.get_mut(&worker) else {
            self.queue.requeue(task);
            return;
        };
        let PendingTask {
            id,
            payload,
            done,
            enqueued_at,
            ..
        } = task;
        match slot.requests.try_send(WorkerRequest::Task { id, payload }) {
            Ok(()) => {
                slot.busy = true;
                slot.current = Some(id);
                self.in_flight.insert(id, InFlight { worker, done });
                debug!(
                    task = %id,
                    worker = %worker,
                    waited_ms = enqueued_at.elapsed().as_millis() as u64,
                    "task dispatched"
                );
            }
            Err(_) => {
                // The worker is gone or wedged; its join result will
                // trigger the respawn. The task cannot be safely retried.
                error!(task = %id, worker = %worker, "dispatch failed; failing the task");
                self.failed += 1;
                let _ = done.send(Err(PoolError::WorkerCrashed { worker }));
            }
        }
    }

    fn handle_worker_exit(&mut self, worker: WorkerId, joined: &Result<(), tokio::task::JoinError>) {
        let crashed = joined.as_ref().err().is_some_and(|err| !err.is_cancelled());
        let slot = self.workers.remove(&worker);
        self.idle.retain(|idle| *idle != worker);
        if !crashed {
            debug!(worker = %worker, "worker exited cleanly");
            return;
        }

        error!(worker = %worker, "worker exited abnormally");
        if let Some(task) = slot.and_then(|slot| slot.current)
            && let Some(entry) = self.in_flight.remove(&task)
        {
            warn!(worker = %worker, task = %task, "failing the task that was in flight on the crashed worker");
            self.failed += 1;
            let _ = entry.done.send(Err(PoolError::WorkerCrashed { worker }));
        }
        if self.draining {
            return;
        }

        let delay = self.config.respawn_delay;
        let commands = self.self_commands.clone();
        debug!(worker = %worker, delay_ms = delay.as_millis() as u64, "scheduling worker respawn");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(Command::Respawn { worker });
        });
    }

    fn cancel_queued(&mut self) -> usize {
        let drained = self.queue.drain();
        let count = drained.len();
        for task in drained {
            self.failed += 1;
            let _ = task.done.send(Err(PoolError::Cancelled));
        }
        count
    }

    async fn drain(mut self, mut replies: Vec<oneshot::Sender<()>>) {
        self.draining = true;
        info!(
            queued = self.queue.len(),
            in_flight = self.in_flight.len(),
            "shutting down worker pool"
        );
        // Queued work is cancelled outright; only in-flight tasks get the
        // grace period.
        self.cancel_queued();
        self.publish_stats();

        let deadline = tokio::time::sleep(self.config.shutdown_timeout);
        tokio::pin!(deadline);
        while !self.in_flight.is_empty() {
            tokio::select! {
                maybe = self.commands.recv() => {
                    match maybe {
                        Some(Command::Shutdown { reply }) => replies.push(reply),
                        Some(Command::Statistics { reply }) => {
                            let _ = reply.send(self.stats_snapshot());
                        }
                        Some(Command::Submit { reply, .. }) => {
                            let _ = reply.send(Err(PoolError::Closed));
                        }
                        Some(Command::ClearQueue { reply }) => {
                            let _ = reply.send(0);
                        }
                        Some(Command::Initialize { reply }) => {
                            warn!("initialize ignored during shutdown");
                            let _ = reply.send(self.workers.len());
                        }
                        Some(Command::Respawn { .. }) | None => {}
                    }
                }
                Some(event) = self.events.recv() => self.handle_event(event),
                Some((worker, joined)) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.handle_worker_exit(worker, &joined);
                }
                () = &mut deadline => {
                    warn!(
                        in_flight = self.in_flight.len(),
                        "drain grace period passed; stopping workers forcibly"
                    );
                    break;
                }
            }
            self.publish_stats();
        }

        self.stop_workers().await;
        self.publish_stats();
        for reply in replies {
            let _ = reply.send(());
        }
        info!(
            completed = self.completed,
            failed = self.failed,
            "worker pool stopped"
        );
    }

    async fn stop_workers(&mut self) {
        for slot in self.workers.values() {
            let _ = slot.requests.try_send(WorkerRequest::Stop);
        }
        if !self.in_flight.is_empty() {
            warn!(abandoned = self.in_flight.len(), "failing tasks still running at forced stop");
            let abandoned: Vec<(TaskId, InFlight<E::Output>)> = self.in_flight.drain().collect();
            for (_, entry) in abandoned {
                self.failed += 1;
                let _ = entry.done.send(Err(PoolError::WorkerCrashed {
                    worker: entry.worker,
                }));
            }
            self.tasks.abort_all();
        }
        while self.tasks.join_next().await.is_some() {}
        self.workers.clear();
        self.idle.clear();
    }

    fn stats_snapshot(&self) -> PoolStats {
        let total = self.workers.len();
        let busy = self.workers.values().filter(|slot| slot.busy).count();
        let elapsed = self.started_at.elapsed();
        let mut workers: Vec<WorkerStats> = self
            .workers
            .iter()
            .map(|(id, slot)| WorkerStats {
                id: *id,
                busy: slot.busy,
                current_task: slot.current,
                tasks_completed: slot.tasks_completed,
                cumulative_processing_ms: slot.processing.as_millis() as u64,
            })
            .collect();
        workers.sort_by_key(|worker| worker.id.0);

        PoolStats {
            workers_total: total,
            workers_busy: busy,
            workers_idle: total - busy,
            utilization_pct: if total == 0 {
                0.0
            } else {
                busy as f64 / total as f64 * 100.0
            },
            queue_depth: self.queue.len(),
            submitted: self.submitted,
            completed: self.completed,
            failed: self.failed,
            in_flight: self.in_flight.len(),
            avg_task_duration_ms: if self.executed == 0 {
                0.0
            } else {
                self.execution_time.as_secs_f64() * 1000.0 / self.executed as f64
            },
            throughput_per_sec: if elapsed.is_zero() {
                0.0
            } else {
                self.completed as f64 / elapsed.as_secs_f64()
            },
            uptime_secs: elapsed.as_secs_f64(),
            workers,
        }
    }

    fn publish_stats(&self) {
        let _ = self.stats_tx.send(self.stats_snapshot());
    }
}
