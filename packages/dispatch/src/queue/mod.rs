//! Durable queue abstraction
//!
//! The broker and the worker loop only need list push / blocking pop,
//! publish / subscribe and a key with expiry. [`RedisQueue`] provides these
//! over Redis; [`InMemoryQueue`] provides them inside one process for
//! single-instance deployments and tests.

mod memory;
mod redis;

pub use self::memory::InMemoryQueue;
pub use self::redis::RedisQueue;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::QueueResult;

/// Buffered messages per subscription before the publisher side waits
pub const SUBSCRIPTION_CAPACITY: usize = 256;

/// Messages received on a subscribed channel. Yields `None` once the
/// subscription is closed for good.
pub type Subscription = mpsc::Receiver<String>;

#[async_trait]
pub trait DurableQueue: Send + Sync + 'static {
    /// Append a serialized job to the tail of `queue`
    async fn push(&self, queue: &str, payload: String) -> QueueResult<()>;

    /// Take the oldest entry of `queue`, waiting at most `timeout`
    async fn blocking_pop(&self, queue: &str, timeout: Duration) -> QueueResult<Option<String>>;

    /// Number of entries waiting in `queue`
    async fn len(&self, queue: &str) -> QueueResult<usize>;

    /// Broadcast a message to the current subscribers of `channel`
    async fn publish(&self, channel: &str, payload: String) -> QueueResult<()>;

    async fn subscribe(&self, channel: &str) -> QueueResult<Subscription>;

    /// Set `key` to `value`, removed by the store after `ttl`
    async fn set_with_expiry(&self, key: &str, value: String, ttl: Duration) -> QueueResult<()>;

    async fn get(&self, key: &str) -> QueueResult<Option<String>>;

    /// Release connections and end subscriptions
    async fn close(&self);
}
