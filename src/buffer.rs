//! Bounded in-memory queues for telemetry records
//!
//! Producers never wait: a push into a full queue fails immediately and the
//! record stays with the caller. Each queue has a single logical consumer,
//! the reporting duty for its record kind.

use crate::errors::{ReporterError, Result};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    /// Records pushed but not yet released by a consumer
    unfinished: usize,
}

/// Fixed-capacity, thread-safe FIFO for one record kind
#[derive(Debug)]
pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: usize,
    batch_window: Duration,
    state: Mutex<QueueState<T>>,
    available: Notify,
    drained: Notify,
}

impl<T> BoundedQueue<T> {
    /// Create a queue; `batch_window` bounds how long a blocking drain waits for the first record.
    pub fn new(name: &'static str, capacity: usize, batch_window: Duration) -> Self {
        Self {
            name,
            capacity,
            batch_window,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                unfinished: 0,
            }),
            available: Notify::new(),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a record without blocking; a full queue rejects the newest record.
    pub fn push(&self, item: T) -> Result<()> {
        {
            let mut state = self.lock();
            if state.items.len() >= self.capacity {
                return Err(ReporterError::QueueFull { queue: self.name });
            }
            state.items.push_back(item);
            state.unfinished += 1;
        }

        self.available.notify_one();
        Ok(())
    }

    /// Pull everything currently resident.
    pub fn take_all(&self) -> Batch<'_, T> {
        let items: Vec<T> = self.lock().items.drain(..).collect();
        Batch::new(self, items)
    }

    /// Pull everything resident. With `block`, an empty queue is given up to
    /// the batch window to receive its first record before returning.
    pub async fn drain(&self, block: bool) -> Batch<'_, T> {
        if block && self.is_empty() {
            let _ = tokio::time::timeout(self.batch_window, self.wait_non_empty()).await;
        }
        self.take_all()
    }

    /// Park until at least one record is resident.
    pub async fn wait_non_empty(&self) {
        loop {
            let notified = self.available.notified();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Release `count` records previously pulled by the consumer.
    pub fn task_done(&self, count: usize) {
        if count == 0 {
            return;
        }

        let remaining = {
            let mut state = self.lock();
            state.unfinished = state.unfinished.saturating_sub(count);
            state.unfinished
        };

        if remaining == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Wait until every record pushed so far has been consumed.
    /// Returns `false` if `limit` elapsed first.
    pub async fn wait_until_drained(&self, limit: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                if self.unfinished() == 0 {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(limit, wait).await {
            Ok(()) => true,
            Err(_) => {
                debug!(queue = self.name, unfinished = self.unfinished(), "drain wait timed out");
                false
            }
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Advisory only; the answer may be stale by the time it is used.
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Advisory only; the answer may be stale by the time it is used.
    pub fn is_full(&self) -> bool {
        self.lock().items.len() >= self.capacity
    }

    pub fn unfinished(&self) -> usize {
        self.lock().unfinished
    }
}

/// Records pulled from a queue. Dropping the batch marks them consumed,
/// whether or not they were delivered.
#[derive(Debug)]
pub struct Batch<'a, T> {
    queue: &'a BoundedQueue<T>,
    items: Vec<T>,
    count: usize,
}

impl<'a, T> Batch<'a, T> {
    fn new(queue: &'a BoundedQueue<T>, items: Vec<T>) -> Self {
        let count = items.len();
        Self { queue, items, count }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T> Drop for Batch<'_, T> {
    fn drop(&mut self) {
        self.queue.task_done(self.count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue(capacity: usize) -> BoundedQueue<u32> {
        BoundedQueue::new("segment", capacity, Duration::from_millis(50))
    }

    #[test]
    fn test_push_within_capacity_keeps_everything() {
        let queue = queue(10);

        for i in 0..7 {
            queue.push(i).unwrap();
        }

        assert_eq!(queue.len(), 7);
        assert_eq!(queue.unfinished(), 7);
        assert!(!queue.is_full());

        let batch = queue.take_all();
        assert_eq!(batch.items(), &[0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_overflow_rejects_newest() {
        let queue = queue(2);

        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert!(queue.is_full());

        let err = queue.push(3).unwrap_err();
        assert!(matches!(err, ReporterError::QueueFull { queue: "segment" }));

        let batch = queue.take_all();
        assert_eq!(batch.items(), &[1, 2]);
    }

    #[test]
    fn test_dropping_batch_marks_done() {
        let queue = queue(4);
        queue.push(1).unwrap();
        queue.push(2).unwrap();

        let batch = queue.take_all();
        assert_eq!(batch.len(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.unfinished(), 2);

        drop(batch);
        assert_eq!(queue.unfinished(), 0);
    }

    #[tokio::test]
    async fn test_wait_until_drained() {
        let queue = Arc::new(queue(4));
        queue.push(1).unwrap();

        assert!(!queue.wait_until_drained(Duration::from_millis(20)).await);

        let consumer = Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let batch = consumer.take_all();
            batch.len()
        });

        assert!(queue.wait_until_drained(Duration::from_secs(5)).await);
        assert_eq!(handle.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_queue_is_already_drained() {
        let queue = queue(4);
        assert!(queue.wait_until_drained(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn test_blocking_drain_waits_for_first_item() {
        let queue = Arc::new(BoundedQueue::new("log", 4, Duration::from_secs(5)));

        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push(42u32).unwrap();
        });

        let batch = queue.drain(true).await;
        assert_eq!(batch.items(), &[42]);
    }

    #[tokio::test]
    async fn test_non_blocking_drain_returns_immediately() {
        let queue = BoundedQueue::<u32>::new("log", 4, Duration::from_secs(60));

        let batch = tokio::time::timeout(Duration::from_secs(1), queue.drain(false))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_producers_respect_capacity() {
        let queue = Arc::new(queue(50));

        let mut handles = Vec::new();
        for p in 0..8u32 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                (0..20u32).filter(|i| queue.push(p * 100 + i).is_ok()).count()
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            accepted += handle.await.unwrap();
        }

        assert_eq!(accepted, 50);
        assert_eq!(queue.len(), 50);
    }
}
