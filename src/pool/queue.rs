//! Priority-ordered task backlog.
//!
//! Highest priority dispatches first; among equal priorities a monotonic
//! sequence number keeps submission order (FIFO). The capacity bound is
//! checked by the coordinator before insertion so a rejected submission
//! never touches the heap.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::error::PoolError;
use crate::pool::TaskId;

/// A task waiting for dispatch.
pub(crate) struct PendingTask<P, R> {
    /// Identifier assigned at submission.
    pub id: TaskId,
    /// Opaque work description.
    pub payload: P,
    /// Higher dispatches first.
    pub priority: i32,
    /// Submission-order tie-break among equal priorities.
    pub seq: u64,
    /// When the task entered the queue.
    pub enqueued_at: Instant,
    /// Resolves the caller's handle.
    pub done: oneshot::Sender<Result<R, PoolError>>,
}

impl<P, R> PartialEq for PendingTask<P, R> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<P, R> Eq for PendingTask<P, R> {}

impl<P, R> Ord for PendingTask<P, R> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: greatest pops first, so higher priority wins and the
        // lower sequence number wins among equals.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<P, R> PartialOrd for PendingTask<P, R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded priority queue owned by the pool coordinator.
pub(crate) struct TaskQueue<P, R> {
    heap: BinaryHeap<PendingTask<P, R>>,
    capacity: usize,
    next_seq: u64,
}

impl<P, R> TaskQueue<P, R> {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            capacity,
            next_seq: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Inserts a new task, assigning its sequence number.
    pub fn push(
        &mut self,
        id: TaskId,
        payload: P,
        priority: i32,
        done: oneshot::Sender<Result<R, PoolError>>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(PendingTask {
            id,
            payload,
            priority,
            seq,
            enqueued_at: Instant::now(),
            done,
        });
    }

    /// Reinserts a task that could not be dispatched, keeping its original
    /// sequence number so its FIFO position survives.
    pub fn requeue(&mut self, task: PendingTask<P, R>) {
        self.heap.push(task);
    }

    /// Removes the head: highest priority, earliest submission among ties.
    pub fn pop(&mut self) -> Option<PendingTask<P, R>> {
        self.heap.pop()
    }

    /// Removes every queued task, in no particular order.
    pub fn drain(&mut self) -> Vec<PendingTask<P, R>> {
        self.heap.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_task(queue: &mut TaskQueue<u32, u32>, payload: u32, priority: i32) {
        let (done, _rx) = oneshot::channel();
        queue.push(TaskId::new(), payload, priority, done);
    }

    #[test]
    fn test_pop_follows_priority() {
        let mut queue: TaskQueue<u32, u32> = TaskQueue::new(10);
        push_task(&mut queue, 1, 0);
        push_task(&mut queue, 2, 5);
        push_task(&mut queue, 3, -2);
        push_task(&mut queue, 4, 5);

        let order: Vec<u32> = std::iter::from_fn(|| queue.pop().map(|t| t.payload)).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_equal_priority_is_fifo() {
        let mut queue: TaskQueue<u32, u32> = TaskQueue::new(10);
        for payload in 0..5 {
            push_task(&mut queue, payload, 7);
        }

        let order: Vec<u32> = std::iter::from_fn(|| queue.pop().map(|t| t.payload)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_capacity_accounting() {
        let mut queue: TaskQueue<u32, u32> = TaskQueue::new(2);
        assert!(!queue.is_full());
        push_task(&mut queue, 1, 0);
        push_task(&mut queue, 2, 0);
        assert!(queue.is_full());
        assert_eq!(queue.len(), 2);

        queue.pop();
        assert!(!queue.is_full());
    }

    #[test]
    fn test_requeue_keeps_fifo_position() {
        let mut queue: TaskQueue<u32, u32> = TaskQueue::new(10);
        push_task(&mut queue, 1, 0);
        push_task(&mut queue, 2, 0);

        let first = queue.pop().unwrap();
        assert_eq!(first.payload, 1);
        queue.requeue(first);

        let order: Vec<u32> = std::iter::from_fn(|| queue.pop().map(|t| t.payload)).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn test_drain_empties_the_queue() {
        let mut queue: TaskQueue<u32, u32> = TaskQueue::new(10);
        for payload in 0..4 {
            push_task(&mut queue, payload, payload as i32);
        }

        let drained = queue.drain();
        assert_eq!(drained.len(), 4);
        assert!(queue.is_empty());
    }
}
