//! Bounded drop-oldest frame queue between the capture and encode tasks.
//!
//! Live capture favours recency: when the queue is full, `push` evicts the
//! single oldest frame to admit the newest one. Evictions are counted so the
//! resulting gaps in sequence numbers are observable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::video_types::Frame;

/// Result of a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Frame admitted without displacing anything.
    Accepted,
    /// Frame admitted after evicting the oldest queued frame, whose sequence
    /// number is carried here.
    EvictedOldest(u64),
}

/// The queue was closed; the rejected frame is handed back.
#[derive(Debug)]
pub struct QueueClosed(pub Frame);

struct Inner {
    frames: VecDeque<Frame>,
    closed: bool,
}

/// Bounded FIFO with drop-oldest admission, one producer and one consumer.
pub struct FrameQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    available: Notify,
    dropped: AtomicU64,
    pushed: AtomicU64,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        tracing::debug!(capacity, "frame queue created");
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            available: Notify::new(),
            dropped: AtomicU64::new(0),
            pushed: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame, evicting the oldest one if the queue is full.
    ///
    /// Never blocks beyond the internal lock.
    pub fn push(&self, frame: Frame) -> Result<Enqueued, QueueClosed> {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(QueueClosed(frame));
            }
            let evicted = if inner.frames.len() >= self.capacity {
                inner.frames.pop_front().map(|old| old.sequence())
            } else {
                None
            };
            inner.frames.push_back(frame);
            evicted
        };

        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.available.notify_one();

        match outcome {
            Some(seq) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(evicted = seq, "frame queue full, dropped oldest frame");
                Ok(Enqueued::EvictedOldest(seq))
            }
            None => Ok(Enqueued::Accepted),
        }
    }

    /// Dequeue the next frame, waiting until one is available.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Frame> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(frame) = inner.frames.pop_front() {
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<Frame> {
        self.lock().frames.pop_front()
    }

    /// Stop admitting frames. Idempotent; queued frames remain poppable.
    pub fn close(&self) {
        let was_open = {
            let mut inner = self.lock();
            !std::mem::replace(&mut inner.closed, true)
        };
        if was_open {
            tracing::debug!(
                pending = self.len(),
                dropped = self.dropped(),
                "frame queue closed"
            );
        }
        self.available.notify_waiters();
        self.available.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames evicted by drop-oldest since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Frames admitted since creation.
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Poisoning only happens if a holder panicked; the deque is still consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::video_types::{DisplayGeometry, PixelFormat};

    fn frame(seq: u64) -> Frame {
        let geometry = DisplayGeometry::new(2, 2, PixelFormat::Rgba);
        Frame::new(seq, seq * 1_000, geometry, vec![seq as u8; 16]).unwrap()
    }

    fn drain(queue: &FrameQueue) -> Vec<u64> {
        std::iter::from_fn(|| queue.try_pop())
            .map(|f| f.sequence())
            .collect()
    }

    #[test]
    fn fifo_order_under_capacity() {
        let queue = FrameQueue::new(4);
        for seq in 0..3 {
            assert_eq!(queue.push(frame(seq)).unwrap(), Enqueued::Accepted);
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(drain(&queue), vec![0, 1, 2]);
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn full_queue_evicts_exactly_the_oldest() {
        let capacity = 5;
        let queue = FrameQueue::new(capacity);
        for seq in 0..capacity as u64 {
            queue.push(frame(seq)).unwrap();
        }

        assert_eq!(queue.push(frame(5)).unwrap(), Enqueued::EvictedOldest(0));
        assert_eq!(queue.len(), capacity);
        assert_eq!(queue.dropped(), 1);

        let retained = drain(&queue);
        assert_eq!(retained, vec![1, 2, 3, 4, 5]);
        assert_eq!(retained.last(), Some(&5), "newest frame must be retained");
    }

    #[test]
    fn sustained_overflow_keeps_newest_window() {
        let queue = FrameQueue::new(3);
        for seq in 0..10 {
            queue.push(frame(seq)).unwrap();
            assert!(queue.len() <= 3);
        }
        assert_eq!(queue.dropped(), 7);
        assert_eq!(queue.pushed(), 10);
        assert_eq!(drain(&queue), vec![7, 8, 9]);
    }

    #[test]
    fn close_is_idempotent_and_rejects_pushes() {
        let queue = FrameQueue::new(2);
        queue.push(frame(0)).unwrap();
        queue.close();
        queue.close();
        assert!(queue.is_closed());

        let QueueClosed(rejected) = queue.push(frame(1)).unwrap_err();
        assert_eq!(rejected.sequence(), 1);
        assert_eq!(drain(&queue), vec![0]);
    }

    #[tokio::test]
    async fn pop_drains_then_reports_exhaustion() {
        let queue = FrameQueue::new(4);
        queue.push(frame(0)).unwrap();
        queue.push(frame(1)).unwrap();
        queue.close();

        assert_eq!(queue.pop().await.map(|f| f.sequence()), Some(0));
        assert_eq!(queue.pop().await.map(|f| f.sequence()), Some(1));
        let end = tokio::time::timeout(Duration::from_millis(100), queue.pop())
            .await
            .expect("pop after close must not block");
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = Arc::new(FrameQueue::new(2));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await.map(|f| f.sequence()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(frame(9)).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(9));
    }

    #[tokio::test]
    async fn pop_wakes_on_close() {
        let queue = Arc::new(FrameQueue::new(2));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await.is_none() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let exhausted = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(exhausted);
    }
}
