//! Outbound buffer for polling transports.
//!
//! Holds encoded frames produced while no poll is attached. Capacity is
//! counted in bytes of encoded frames; producers block (asynchronously) while
//! the buffer is full and give up after a caller-supplied wait.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Decides whether an offered item is accepted into the buffer.
pub trait BufferListener: Send + Sync {
    /// Returns false to drop the item. Called with the buffer locked.
    fn on_message(&self, message: &str) -> bool;
}

impl<F> BufferListener for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn on_message(&self, message: &str) -> bool {
        self(message)
    }
}

/// Listener that drops everything, installed once the owning handler aborted.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAll;

impl BufferListener for RejectAll {
    fn on_message(&self, _message: &str) -> bool {
        false
    }
}

/// Statistics for a transport buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Items currently queued.
    pub queued: usize,
    /// Bytes currently queued.
    pub queued_bytes: usize,
    /// Configured capacity in bytes.
    pub capacity: usize,
}

struct BufferInner {
    queue: VecDeque<String>,
    size: usize,
    listener: Option<Arc<dyn BufferListener>>,
}

/// Bounded FIFO of encoded frames awaiting the next poll.
pub struct TransportBuffer {
    capacity: usize,
    inner: Mutex<BufferInner>,
    space_freed: Notify,
    data_ready: Notify,
}

impl std::fmt::Debug for TransportBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportBuffer")
            .field("stats", &self.stats())
            .finish()
    }
}

impl TransportBuffer {
    /// Creates an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(BufferInner {
                queue: VecDeque::new(),
                size: 0,
                listener: None,
            }),
            space_freed: Notify::new(),
            data_ready: Notify::new(),
        }
    }

    /// Enqueues an item, waiting up to `max_wait` for room.
    ///
    /// Returns false if the buffer stayed full for the whole wait. An item
    /// refused by the listener counts as delivered. An item larger than the
    /// whole capacity is accepted once the buffer is empty.
    pub async fn put(&self, item: String, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            let freed = self.space_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if let Some(listener) = &inner.listener {
                    if !listener.on_message(&item) {
                        return true;
                    }
                }
                if inner.queue.is_empty() || inner.size + item.len() <= self.capacity {
                    inner.size += item.len();
                    inner.queue.push_back(item);
                    drop(inner);
                    self.data_ready.notify_waiters();
                    return true;
                }
            }

            if tokio::time::timeout_at(deadline, freed).await.is_err() {
                return false;
            }
        }
    }

    /// Removes and returns everything queued, in insertion order.
    pub fn drain_all(&self) -> Vec<String> {
        let drained: Vec<String> = {
            let mut inner = self.inner.lock();
            inner.size = 0;
            inner.queue.drain(..).collect()
        };
        if !drained.is_empty() {
            self.space_freed.notify_waiters();
        }
        drained
    }

    /// Drains the buffer into one concatenated payload.
    pub fn drain_joined(&self) -> String {
        self.drain_all().concat()
    }

    /// Discards everything queued.
    pub fn clear(&self) {
        self.drain_all();
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Installs the listener consulted on every enqueue.
    pub fn set_listener(&self, listener: Arc<dyn BufferListener>) {
        self.inner.lock().listener = Some(listener);
    }

    /// Drops all future items without reporting an error to producers.
    pub fn reject_all(&self) {
        self.set_listener(Arc::new(RejectAll));
        // Producers blocked on a full buffer must observe the listener.
        self.space_freed.notify_waiters();
    }

    /// Resolves once at least one item is queued.
    pub async fn wait_non_empty(&self) {
        loop {
            let ready = self.data_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();
            if !self.is_empty() {
                return;
            }
            ready.await;
        }
    }

    /// Returns a snapshot of the buffer occupancy.
    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.lock();
        BufferStats {
            queued: inner.queue.len(),
            queued_bytes: inner.size,
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn test_drain_preserves_fifo_order() {
        let buffer = TransportBuffer::new(1024);
        for item in ["a", "b", "c"] {
            assert!(buffer.put(item.to_string(), WAIT).await);
        }
        assert_eq!(buffer.drain_all(), vec!["a", "b", "c"]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_drain_joined_concatenates() {
        let buffer = TransportBuffer::new(1024);
        buffer.put("~1~1~x".to_string(), WAIT).await;
        buffer.put("~1~1~y".to_string(), WAIT).await;
        assert_eq!(buffer.drain_joined(), "~1~1~x~1~1~y");
        assert_eq!(buffer.stats().queued_bytes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_times_out_when_full() {
        let buffer = TransportBuffer::new(4);
        assert!(buffer.put("abcd".to_string(), WAIT).await);
        assert!(!buffer.put("e".to_string(), WAIT).await);
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_resumes_after_drain() {
        let buffer = Arc::new(TransportBuffer::new(4));
        assert!(buffer.put("abcd".to_string(), WAIT).await);

        let producer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.put("efgh".to_string(), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(buffer.drain_all(), vec!["abcd"]);

        assert!(producer.await.unwrap());
        assert_eq!(buffer.drain_all(), vec!["efgh"]);
    }

    #[tokio::test]
    async fn test_oversized_item_accepted_when_empty() {
        let buffer = TransportBuffer::new(2);
        assert!(buffer.put("too large".to_string(), WAIT).await);
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_listener_drops_silently() {
        let buffer = TransportBuffer::new(1024);
        buffer.set_listener(Arc::new(|message: &str| message != "drop-me"));
        assert!(buffer.put("drop-me".to_string(), WAIT).await);
        assert!(buffer.put("keep".to_string(), WAIT).await);
        assert_eq!(buffer.drain_all(), vec!["keep"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_all_releases_blocked_producer() {
        let buffer = Arc::new(TransportBuffer::new(1));
        assert!(buffer.put("x".to_string(), WAIT).await);

        let producer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.put("y".to_string(), Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        buffer.reject_all();
        buffer.clear();

        assert!(producer.await.unwrap());
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_wait_non_empty_wakes_on_put() {
        let buffer = Arc::new(TransportBuffer::new(1024));
        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.wait_non_empty().await })
        };
        tokio::task::yield_now().await;
        buffer.put("x".to_string(), WAIT).await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }
}
