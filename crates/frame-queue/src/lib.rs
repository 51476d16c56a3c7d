//! Per-request frame queue.
//!
//! Every in-flight request owns exactly one `FrameQueue`. The agent bridge
//! enqueues frames as they arrive on the WebSocket; the request pipeline is
//! the single consumer. Closing the queue releases any parked consumer with
//! the reason the queue went away, so the pipeline can distinguish a dead
//! connection from a client cancel or a retry.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

use fleetgate_core_types::CloseReason;

/// Idle deadline applied when the consumer does not pass one explicitly.
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum QueueError {
    #[error("queue dequeue timed out")]
    Timeout,
    #[error("queue closed: {0}")]
    Closed(CloseReason),
}

struct Inner<T> {
    buffer: VecDeque<T>,
    waiter: Option<oneshot::Sender<T>>,
    closed: Option<CloseReason>,
}

/// Ordered, closeable, single-consumer FIFO.
pub struct FrameQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Send + 'static> FrameQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                buffer: VecDeque::new(),
                waiter: None,
                closed: None,
            }),
        }
    }

    /// Deliver one item. Resolves a parked consumer directly, otherwise
    /// buffers. Items offered after `close` are dropped.
    pub fn enqueue(&self, item: T) {
        let mut inner = self.inner.lock();
        if inner.closed.is_some() {
            return;
        }
        if let Some(waiter) = inner.waiter.take() {
            // The consumer may have timed out between parking and now; the
            // item is not lost in that race, it goes back to the buffer.
            if let Err(item) = waiter.send(item) {
                inner.buffer.push_back(item);
            }
        } else {
            inner.buffer.push_back(item);
        }
    }

    /// Wait for the next item, up to `timeout`.
    ///
    /// The queue is single-consumer: a second concurrent `dequeue` displaces
    /// the first waiter, which then observes `Closed(Unknown)`.
    pub async fn dequeue(&self, timeout: Duration) -> Result<T, QueueError> {
        let mut rx = {
            let mut inner = self.inner.lock();
            if let Some(item) = inner.buffer.pop_front() {
                return Ok(item);
            }
            if let Some(reason) = inner.closed {
                return Err(QueueError::Closed(reason));
            }
            let (tx, rx) = oneshot::channel();
            inner.waiter = Some(tx);
            rx
        };

        tokio::select! {
            resolved = &mut rx => match resolved {
                Ok(item) => Ok(item),
                // Sender dropped without a value: either `close` released us
                // or a newer consumer displaced this waiter.
                Err(_) => {
                    let inner = self.inner.lock();
                    Err(QueueError::Closed(
                        inner.closed.unwrap_or(CloseReason::Unknown),
                    ))
                }
            },
            _ = tokio::time::sleep(timeout) => {
                // Retract the waiter under the lock, then drain a frame that
                // may have been resolved concurrently with the deadline so
                // exactly one outcome is observed.
                {
                    let mut inner = self.inner.lock();
                    inner.waiter = None;
                    if let Some(item) = inner.buffer.pop_front() {
                        return Ok(item);
                    }
                }
                match rx.try_recv() {
                    Ok(item) => Ok(item),
                    Err(_) => Err(QueueError::Timeout),
                }
            }
        }
    }

    /// Wait with the default 300 s idle deadline.
    pub async fn dequeue_default(&self) -> Result<T, QueueError> {
        self.dequeue(DEFAULT_DEQUEUE_TIMEOUT).await
    }

    /// Close the queue. Idempotent: the first reason wins. Buffered items
    /// are dropped and any parked consumer is released.
    pub fn close(&self, reason: CloseReason) {
        let waiter = {
            let mut inner = self.inner.lock();
            if inner.closed.is_some() {
                return;
            }
            inner.closed = Some(reason);
            inner.buffer.clear();
            inner.waiter.take()
        };
        drop(waiter);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.lock().closed
    }

    /// Number of buffered, undelivered items.
    pub fn len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buffer.is_empty()
    }
}

impl<T: Send + 'static> Default for FrameQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let queue = FrameQueue::new();
        queue.enqueue(1u32);
        queue.enqueue(2);
        queue.enqueue(3);
        assert_eq!(queue.dequeue(Duration::from_millis(50)).await, Ok(1));
        assert_eq!(queue.dequeue(Duration::from_millis(50)).await, Ok(2));
        assert_eq!(queue.dequeue(Duration::from_millis(50)).await, Ok(3));
    }

    #[tokio::test]
    async fn parked_consumer_resolves_on_enqueue() {
        let queue = Arc::new(FrameQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue("frame");
        assert_eq!(waiter.await.unwrap(), Ok("frame"));
    }

    #[tokio::test]
    async fn dequeue_times_out() {
        let queue: FrameQueue<u32> = FrameQueue::new();
        let result = queue.dequeue(Duration::from_millis(30)).await;
        assert_eq!(result, Err(QueueError::Timeout));
    }

    #[tokio::test]
    async fn close_releases_parked_consumer_with_reason() {
        let queue: Arc<FrameQueue<u32>> = Arc::new(FrameQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close(CloseReason::ClientDisconnect);
        assert_eq!(
            waiter.await.unwrap(),
            Err(QueueError::Closed(CloseReason::ClientDisconnect))
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_first_reason_wins() {
        let queue: FrameQueue<u32> = FrameQueue::new();
        queue.close(CloseReason::RequestComplete);
        queue.close(CloseReason::ConnectionLost);
        assert_eq!(queue.close_reason(), Some(CloseReason::RequestComplete));
        assert_eq!(
            queue.dequeue(Duration::from_millis(10)).await,
            Err(QueueError::Closed(CloseReason::RequestComplete))
        );
    }

    #[tokio::test]
    async fn enqueue_after_close_is_dropped() {
        let queue = FrameQueue::new();
        queue.close(CloseReason::RetryCreatingNewQueue);
        queue.enqueue(7u32);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn buffered_frame_survives_concurrent_close() {
        // A frame already handed to the consumer is not revoked by close.
        let queue = FrameQueue::new();
        queue.enqueue(42u32);
        let got = queue.dequeue(Duration::from_millis(50)).await;
        queue.close(CloseReason::ConnectionLost);
        assert_eq!(got, Ok(42));
    }

    #[tokio::test]
    async fn each_frame_delivered_at_most_once() {
        let queue = Arc::new(FrameQueue::new());
        for i in 0..100u32 {
            queue.enqueue(i);
        }
        let mut seen = Vec::new();
        while let Ok(item) = queue.dequeue(Duration::from_millis(10)).await {
            seen.push(item);
        }
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }
}
