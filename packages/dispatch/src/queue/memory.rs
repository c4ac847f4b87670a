//! Process-local durable queue
//!
//! Behaves like the Redis backend within one process: FIFO lists with a
//! blocking pop, fan-out pub/sub and keys that expire. Uses the tokio clock,
//! so expiry and pop timeouts follow a paused test clock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use super::{DurableQueue, Subscription, SUBSCRIPTION_CAPACITY};
use crate::error::{QueueError, QueueResult};

/// In-memory implementation of [`DurableQueue`].
///
/// Clones share the same underlying store, so a broker and a worker loop
/// built from clones of one queue talk to each other.
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    pushed: Notify,
    channels: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
    keys: Mutex<HashMap<String, Entry>>,
    closed: AtomicBool,
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    fn try_pop(&self, queue: &str) -> Option<String> {
        lock(&self.inner.lists)
            .get_mut(queue)
            .and_then(|list| list.pop_front())
    }

    /// Number of live subscriptions on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        lock(&self.inner.channels)
            .get(channel)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    async fn push(&self, queue: &str, payload: String) -> QueueResult<()> {
        self.ensure_open()?;
        lock(&self.inner.lists)
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
        self.inner.pushed.notify_waiters();
        Ok(())
    }

    async fn blocking_pop(&self, queue: &str, timeout: Duration) -> QueueResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            self.ensure_open()?;
            // Register interest before checking so a concurrent push is not missed
            let notified = self.inner.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.try_pop(queue) {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn len(&self, queue: &str) -> QueueResult<usize> {
        self.ensure_open()?;
        Ok(lock(&self.inner.lists).get(queue).map_or(0, VecDeque::len))
    }

    async fn publish(&self, channel: &str, payload: String) -> QueueResult<()> {
        self.ensure_open()?;
        let senders = {
            let mut channels = lock(&self.inner.channels);
            match channels.get_mut(channel) {
                Some(senders) => {
                    senders.retain(|s| !s.is_closed());
                    senders.clone()
                }
                None => return Ok(()),
            }
        };
        for sender in senders {
            // A subscriber that went away in between is not an error
            let _ = sender.send(payload.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> QueueResult<Subscription> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        lock(&self.inner.channels)
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn set_with_expiry(&self, key: &str, value: String, ttl: Duration) -> QueueResult<()> {
        self.ensure_open()?;
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        lock(&self.inner.keys).insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        self.ensure_open()?;
        let mut keys = lock(&self.inner.keys);
        let expired = match keys.get(key) {
            None => return Ok(None),
            Some(entry) => entry.expires_at.is_some_and(|at| Instant::now() >= at),
        };
        if expired {
            keys.remove(key);
            return Ok(None);
        }
        Ok(keys.get(key).map(|entry| entry.value.clone()))
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        // Dropping the senders ends every subscription
        lock(&self.inner.channels).clear();
        self.inner.pushed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_pop_is_fifo() {
        let queue = InMemoryQueue::new();
        queue.push("jobs", "a".into()).await.unwrap();
        queue.push("jobs", "b".into()).await.unwrap();
        assert_eq!(queue.len("jobs").await.unwrap(), 2);

        let timeout = Duration::from_millis(10);
        assert_eq!(queue.blocking_pop("jobs", timeout).await.unwrap().as_deref(), Some("a"));
        assert_eq!(queue.blocking_pop("jobs", timeout).await.unwrap().as_deref(), Some("b"));
        assert_eq!(queue.len("jobs").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_pop_times_out() {
        let queue = InMemoryQueue::new();
        let started = Instant::now();
        let popped = queue.blocking_pop("jobs", Duration::from_secs(30)).await.unwrap();
        assert!(popped.is_none());
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_pop_wakes_on_push() {
        let queue = InMemoryQueue::new();
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            producer.push("jobs", "late".into()).await.unwrap();
        });

        let started = Instant::now();
        let popped = queue.blocking_pop("jobs", Duration::from_secs(30)).await.unwrap();
        assert_eq!(popped.as_deref(), Some("late"));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_publish_fans_out() {
        let queue = InMemoryQueue::new();
        let mut first = queue.subscribe("results").await.unwrap();
        let mut second = queue.subscribe("results").await.unwrap();
        queue.publish("other", "ignored".into()).await.unwrap();
        queue.publish("results", "hello".into()).await.unwrap();

        assert_eq!(first.recv().await.as_deref(), Some("hello"));
        assert_eq!(second.recv().await.as_deref(), Some("hello"));
        assert!(first.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_expire() {
        let queue = InMemoryQueue::new();
        queue
            .set_with_expiry("heartbeat", "1".into(), Duration::from_secs(120))
            .await
            .unwrap();
        assert_eq!(queue.get("heartbeat").await.unwrap().as_deref(), Some("1"));

        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(queue.get("heartbeat").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions_and_rejects_calls() {
        let queue = InMemoryQueue::new();
        let mut sub = queue.subscribe("results").await.unwrap();
        queue.close().await;

        assert!(sub.recv().await.is_none());
        assert!(matches!(
            queue.push("jobs", "x".into()).await,
            Err(QueueError::Closed)
        ));
        assert!(queue.is_closed());
    }
}
