//! Bounded hand-off queue between discovery producers and their consumer.
//!
//! Producers (the mDNS callback inside the swarm event loop) must never block,
//! so a full queue sheds load according to an explicit [`OverflowPolicy`].

use flume::TrySendError;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// What to discard when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued item to make room
    DropOldest,
    /// Discard the incoming item
    DropNewest,
}

/// Result of a [`PeerQueue::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Item queued without loss
    Queued,
    /// Item queued, the oldest item was evicted
    EvictedOldest,
    /// Queue full, the item was discarded
    Discarded,
    /// Queue closed, the item was discarded
    Closed,
}

/// Bounded multi-producer queue with a non-blocking `push`
pub struct PeerQueue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    // `None` once closed; dropping the only sender ends the receiver.
    sender: Mutex<Option<flume::Sender<T>>>,
    receiver: flume::Receiver<T>,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl<T> Clone for PeerQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> PeerQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let (sender, receiver) = flume::bounded(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                sender: Mutex::new(Some(sender)),
                receiver,
                policy,
                dropped: AtomicU64::new(0),
            }),
        }
    }

    fn sender(&self) -> MutexGuard<'_, Option<flume::Sender<T>>> {
        self.inner.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an item without waiting
    pub fn push(&self, item: T) -> PushOutcome {
        // Producers are serialized so an eviction always makes room for its own item.
        let guard = self.sender();
        let Some(sender) = guard.as_ref() else {
            return PushOutcome::Closed;
        };

        let item = match sender.try_send(item) {
            Ok(()) => return PushOutcome::Queued,
            Err(TrySendError::Disconnected(_)) => return PushOutcome::Closed,
            Err(TrySendError::Full(item)) => item,
        };

        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        match self.inner.policy {
            OverflowPolicy::DropOldest => {
                let _ = self.inner.receiver.try_recv();
                match sender.try_send(item) {
                    Ok(()) => PushOutcome::EvictedOldest,
                    Err(_) => PushOutcome::Discarded,
                }
            }
            OverflowPolicy::DropNewest => PushOutcome::Discarded,
        }
    }

    /// Wait for the next item; `None` once the queue is closed and drained
    pub async fn pop(&self) -> Option<T> {
        self.inner.receiver.recv_async().await.ok()
    }

    /// Stop accepting items; queued items can still be drained
    pub fn close(&self) {
        self.sender().take();
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.inner.receiver.len()
    }

    /// Whether no items are queued
    pub fn is_empty(&self) -> bool {
        self.inner.receiver.is_empty()
    }

    /// Number of items lost to overflow
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl<T: Send + 'static> PeerQueue<T> {
    /// Consume the queue as a stream
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static {
        stream::unfold(self, |queue| async move {
            let item = queue.pop().await?;
            Some((item, queue))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = PeerQueue::new(4, OverflowPolicy::DropOldest);
        for i in 0..3 {
            assert_eq!(queue.push(i), PushOutcome::Queued);
        }
        assert_eq!(queue.pop().await, Some(0));
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
    }

    #[tokio::test]
    async fn test_drop_oldest_policy() {
        let queue = PeerQueue::new(2, OverflowPolicy::DropOldest);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.push(3), PushOutcome::EvictedOldest);

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
    }

    #[tokio::test]
    async fn test_drop_newest_policy() {
        let queue = PeerQueue::new(2, OverflowPolicy::DropNewest);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.push(3), PushOutcome::Discarded);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = PeerQueue::new(4, OverflowPolicy::DropOldest);
        queue.push("a");
        queue.close();
        assert_eq!(queue.push("b"), PushOutcome::Closed);

        let items: Vec<_> = queue.into_stream().collect().await;
        assert_eq!(items, vec!["a"]);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = PeerQueue::new(1, OverflowPolicy::DropOldest);
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(7);

        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, Some(7));
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumer() {
        let queue: PeerQueue<u8> = PeerQueue::new(1, OverflowPolicy::DropNewest);
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, None);
    }
}
