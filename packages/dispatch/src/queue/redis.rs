//! Redis-backed durable queue
//!
//! Jobs live in a Redis list (LPUSH at the head, BRPOP from the tail),
//! results travel over pub/sub and the heartbeat is a key with EX expiry.
//! BRPOP holds its connection for the whole wait, so it gets a dedicated
//! connection and never delays pushes, publishes or heartbeats.
//!
//! A multiplexed connection does not reconnect by itself. A command that
//! fails because the connection broke replaces it, so the command fails but
//! the next one runs on a fresh connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{Cmd, FromRedisValue};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use trackrelay_shared_config::RedisConfig;

use super::{DurableQueue, Subscription, SUBSCRIPTION_CAPACITY};
use crate::error::{QueueError, QueueResult};

const MAX_RESUBSCRIBE_DELAY_SECS: u64 = 60;
const MAX_RESUBSCRIBE_ATTEMPTS: u32 = 100;

pub struct RedisQueue {
    client: redis::Client,
    connect_timeout: Duration,
    conn: Mutex<MultiplexedConnection>,
    blocking: tokio::sync::Mutex<MultiplexedConnection>,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    redacted_url: String,
}

impl RedisQueue {
    /// Open both connections and check the server answers PING
    pub async fn connect(config: &RedisConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.connection_url())?;
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs.max(1));

        let mut conn = Self::open_connection(&client, connect_timeout).await?;
        let blocking = Self::open_connection(&client, connect_timeout).await?;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        tracing::info!(url = %config.redacted_url(), reply = %pong, "Connected to Redis");

        Ok(Self {
            client,
            connect_timeout,
            conn: Mutex::new(conn),
            blocking: tokio::sync::Mutex::new(blocking),
            subscriptions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            redacted_url: config.redacted_url(),
        })
    }

    async fn open_connection(
        client: &redis::Client,
        connect_timeout: Duration,
    ) -> QueueResult<MultiplexedConnection> {
        tokio::time::timeout(connect_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| QueueError::Timeout {
                what: "redis connection",
                after: connect_timeout,
            })?
            .map_err(QueueError::from)
    }

    async fn open_pubsub(client: &redis::Client, channel: &str) -> Result<PubSub, redis::RedisError> {
        let conn = client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(channel).await?;
        Ok(pubsub)
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    /// Run a command on the shared connection
    async fn query<T: FromRedisValue + Send>(&self, cmd: &Cmd) -> QueueResult<T> {
        self.ensure_open()?;
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match cmd.query_async::<_, T>(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if is_connection_error(&e) {
                    tracing::warn!(error = %e, url = %self.redacted_url, "Redis connection lost, reopening");
                    if let Some(fresh) = self.reopen().await {
                        *self.conn.lock().unwrap_or_else(|e| e.into_inner()) = fresh;
                    }
                }
                Err(e.into())
            }
        }
    }

    async fn reopen(&self) -> Option<MultiplexedConnection> {
        match Self::open_connection(&self.client, self.connect_timeout).await {
            Ok(fresh) => {
                tracing::info!(url = %self.redacted_url, "Redis connection reopened");
                Some(fresh)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redis still unreachable, retrying on the next command");
                None
            }
        }
    }

    /// Forward channel messages until the receiver goes away, resubscribing
    /// with doubling backoff when the connection drops
    async fn forward_messages(
        client: redis::Client,
        channel: String,
        mut pubsub: PubSub,
        sender: mpsc::Sender<String>,
    ) {
        let mut attempts = 0u32;
        let mut delay_secs = 1u64;

        loop {
            {
                let mut stream = pubsub.on_message();
                while let Some(msg) = stream.next().await {
                    match msg.get_payload::<String>() {
                        Ok(payload) => {
                            if sender.send(payload).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, channel = %channel, "Dropping non-text pub/sub message");
                        }
                    }
                }
            }

            if sender.is_closed() {
                return;
            }
            tracing::warn!(channel = %channel, "Redis subscription disconnected, reconnecting...");

            loop {
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                match Self::open_pubsub(&client, &channel).await {
                    Ok(fresh) => {
                        pubsub = fresh;
                        attempts = 0;
                        delay_secs = 1;
                        tracing::info!(channel = %channel, "Redis subscription restored");
                        break;
                    }
                    Err(e) => {
                        attempts += 1;
                        if attempts >= MAX_RESUBSCRIBE_ATTEMPTS {
                            tracing::error!(
                                channel = %channel,
                                "Redis pub/sub max reconnect attempts ({}) exceeded, giving up",
                                MAX_RESUBSCRIBE_ATTEMPTS
                            );
                            return;
                        }
                        tracing::error!(
                            error = %e,
                            attempt = attempts,
                            delay_secs = delay_secs,
                            "Redis pub/sub reconnect failed"
                        );
                        delay_secs = (delay_secs * 2).min(MAX_RESUBSCRIBE_DELAY_SECS);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("url", &self.redacted_url)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DurableQueue for RedisQueue {
    async fn push(&self, queue: &str, payload: String) -> QueueResult<()> {
        self.query::<()>(redis::cmd("LPUSH").arg(queue).arg(payload)).await
    }

    async fn blocking_pop(&self, queue: &str, timeout: Duration) -> QueueResult<Option<String>> {
        self.ensure_open()?;
        let mut conn = self.blocking.lock().await;
        // BRPOP's timeout is whole seconds and 0 means forever
        let popped: Result<Option<(String, String)>, _> = redis::cmd("BRPOP")
            .arg(queue)
            .arg(timeout.as_secs().max(1))
            .query_async(&mut *conn)
            .await;

        match popped {
            Ok(popped) => Ok(popped.map(|(_, payload)| payload)),
            Err(e) => {
                if is_connection_error(&e) {
                    tracing::warn!(error = %e, url = %self.redacted_url, "Redis blocking connection lost, reopening");
                    if let Some(fresh) = self.reopen().await {
                        *conn = fresh;
                    }
                }
                Err(e.into())
            }
        }
    }

    async fn len(&self, queue: &str) -> QueueResult<usize> {
        self.query(redis::cmd("LLEN").arg(queue)).await
    }

    async fn publish(&self, channel: &str, payload: String) -> QueueResult<()> {
        let receivers: i64 = self
            .query(redis::cmd("PUBLISH").arg(channel).arg(payload))
            .await?;
        if receivers == 0 {
            tracing::debug!(channel = %channel, "Published with no subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> QueueResult<Subscription> {
        self.ensure_open()?;
        let pubsub = Self::open_pubsub(&self.client, channel).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);

        let task = tokio::spawn(Self::forward_messages(
            self.client.clone(),
            channel.to_string(),
            pubsub,
            tx,
        ));
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);

        tracing::debug!(channel = %channel, "Subscribed");
        Ok(rx)
    }

    async fn set_with_expiry(&self, key: &str, value: String, ttl: Duration) -> QueueResult<()> {
        self.query::<()>(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl.as_secs().max(1)),
        )
        .await
    }

    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks: Vec<_> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        tracing::info!(url = %self.redacted_url, "Redis queue closed");
    }
}

/// Errors after which the connection itself is unusable
fn is_connection_error(e: &redis::RedisError) -> bool {
    e.is_connection_dropped() || e.is_io_error() || e.is_connection_refusal() || e.is_timeout()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broken_connection_is_detected() {
        let reset = redis::RedisError::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(is_connection_error(&reset));

        let refused = redis::RedisError::from(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(is_connection_error(&refused));
    }

    #[test]
    fn test_command_errors_keep_the_connection() {
        let wrong_type = redis::RedisError::from((redis::ErrorKind::TypeError, "WRONGTYPE"));
        assert!(!is_connection_error(&wrong_type));

        let auth = redis::RedisError::from((redis::ErrorKind::AuthenticationFailed, "bad password"));
        assert!(!is_connection_error(&auth));
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_server_fails() {
        let config = RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            password: None,
            connect_timeout_secs: 1,
        };
        assert!(RedisQueue::connect(&config).await.is_err());
    }
}
