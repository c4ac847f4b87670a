//! Remote dispatch over a durable queue
//!
//! The broker pushes serialized jobs onto the queue list and listens on the
//! result channel. Each result is matched to its caller by job id. A caller
//! waiting through [`Broker::request`] holds a pending call with its own
//! timer; whichever of result and timer comes first settles the handle and
//! the other is discarded.
//!
//! Results are delivered at most once. A result for an id that already
//! timed out, or that this broker never sent, is dropped and only counted.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use trackrelay_shared_config::{BrokerConfig, RedisConfig};

use crate::error::{DispatchError, DispatchResult, QueueResult};
use crate::handle::{JobHandle, Settle};
use crate::job::{AcceptAll, Job, JobId, JobValidator, TaskResult};
use crate::queue::{DurableQueue, RedisQueue, Subscription};

/// Buffered results per [`Broker::completions`] receiver
const COMPLETIONS_CAPACITY: usize = 256;

/// Attempts at drawing a job id not already tracked
const MAX_ID_ATTEMPTS: usize = 8;

/// Snapshot of the durable queue as seen by this broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Jobs waiting in the durable queue (advisory)
    pub pending: usize,
    pub has_worker: bool,
    /// Callers of this broker currently waiting for a result
    pub awaiting: usize,
}

/// Broker delivery counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub enqueued: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub delivered_detached: u64,
    pub timed_out: u64,
    /// Results whose caller had already timed out
    pub dropped_late: u64,
    /// Results for ids this broker never sent (or no longer remembers)
    pub dropped_unknown: u64,
    pub parse_failures: u64,
    pub awaiting: usize,
    pub detached: usize,
}

/// Producer side of remote execution.
///
/// Cloning yields another handle to the same broker.
pub struct Broker<P> {
    inner: Arc<BrokerInner<P>>,
}

impl<P> Clone for Broker<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> std::fmt::Debug for Broker<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("connected", &self.inner.current_link().is_some())
            .field("stats", &self.inner.correlator.stats())
            .finish()
    }
}

struct BrokerInner<P> {
    config: BrokerConfig,
    validator: Box<dyn JobValidator<P>>,
    /// Serializes connect and disconnect
    connecting: tokio::sync::Mutex<()>,
    /// Bumped whenever a connect run finishes, successful or not
    connect_runs: AtomicU64,
    link: LinkSlot,
    link_generation: AtomicU64,
    correlator: Arc<Correlator>,
}

type LinkSlot = Arc<RwLock<Option<Arc<Link>>>>;

struct Link {
    queue: Arc<dyn DurableQueue>,
    listener: JoinHandle<()>,
    generation: u64,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Result routing state shared by the broker, its listener task and timers
struct Correlator {
    pending: DashMap<JobId, PendingCall>,
    detached: DashMap<JobId, Instant>,
    expired: DashMap<JobId, Instant>,
    completions: broadcast::Sender<TaskResult>,
    retention: Duration,
    enqueued: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
    delivered_detached: AtomicU64,
    timed_out: AtomicU64,
    dropped_late: AtomicU64,
    dropped_unknown: AtomicU64,
    parse_failures: AtomicU64,
}

struct PendingCall {
    settle: Settle<Value>,
    timer: AbortHandle,
}

impl<P> Broker<P>
where
    P: Serialize + Send + Sync + 'static,
{
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_validator(config, AcceptAll)
    }

    /// Broker that rejects payloads the validator refuses, before pushing
    pub fn with_validator(
        config: BrokerConfig,
        validator: impl JobValidator<P> + 'static,
    ) -> Self {
        let (completions, _) = broadcast::channel(COMPLETIONS_CAPACITY);
        let correlator = Arc::new(Correlator {
            pending: DashMap::new(),
            detached: DashMap::new(),
            expired: DashMap::new(),
            completions,
            retention: config.retention(),
            enqueued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            delivered_detached: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            dropped_late: AtomicU64::new(0),
            dropped_unknown: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
        });

        Self {
            inner: Arc::new(BrokerInner {
                config,
                validator: Box::new(validator),
                connecting: tokio::sync::Mutex::new(()),
                connect_runs: AtomicU64::new(0),
                link: Arc::new(RwLock::new(None)),
                link_generation: AtomicU64::new(0),
                correlator,
            }),
        }
    }

    /// Connect to Redis.
    ///
    /// Returns `false` when no Redis is configured or every attempt of the
    /// reconnect policy failed; the caller should run jobs locally.
    pub async fn connect(&self, redis: Option<&RedisConfig>) -> bool {
        let Some(redis) = redis else {
            tracing::info!("Redis not configured, remote dispatch disabled");
            return false;
        };
        self.connect_with(|| RedisQueue::connect(redis)).await
    }

    /// Connect through any durable queue, opened by `open` on each attempt.
    ///
    /// Idempotent. Callers arriving while another connect is in flight wait
    /// for it and share its outcome instead of starting their own.
    pub async fn connect_with<F, Fut, Q>(&self, mut open: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = QueueResult<Q>>,
        Q: DurableQueue,
    {
        if self.is_connected() {
            return true;
        }

        let runs_before = self.inner.connect_runs.load(Ordering::Acquire);
        let _guard = self.inner.connecting.lock().await;
        if self.inner.connect_runs.load(Ordering::Acquire) != runs_before {
            return self.is_connected();
        }
        if self.is_connected() {
            return true;
        }

        let policy = self.inner.config.reconnect;
        let mut connected = false;
        for attempt in 1..=policy.max_attempts.max(1) {
            match open().await {
                Ok(queue) => match self.inner.establish(Arc::new(queue)).await {
                    Ok(()) => {
                        connected = true;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, attempt, "Failed to subscribe to results channel");
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "Failed to connect to durable queue");
                }
            }

            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
        }

        if !connected {
            tracing::error!(
                attempts = policy.max_attempts,
                "Giving up on durable queue, remote execution unavailable"
            );
        }
        self.inner.connect_runs.fetch_add(1, Ordering::AcqRel);
        connected
    }

    pub fn is_connected(&self) -> bool {
        self.inner.current_link().is_some()
    }

    /// Push a job without waiting for it.
    ///
    /// Its result, when it arrives, is sent to [`Broker::completions`].
    /// Returns the id the job was pushed under, which differs from
    /// `job.id` if that id was already in use.
    pub async fn enqueue(&self, mut job: Job<P>) -> DispatchResult<JobId> {
        let link = self.inner.admit(&job)?;
        self.inner.claim_detached(&mut job)?;

        if let Err(e) = self.inner.push(&link, &job).await {
            self.inner.correlator.detached.remove(&job.id);
            return Err(e);
        }

        tracing::info!(job_id = %job.id, user_id = ?job.user_id, "Job enqueued for remote worker");
        Ok(job.id)
    }

    /// Push a job and return a handle that settles with its remote result,
    /// or with [`DispatchError::TimedOut`] once `timeout` elapses.
    pub async fn request(&self, mut job: Job<P>, timeout: Duration) -> DispatchResult<JobHandle<Value>> {
        let link = self.inner.admit(&job)?;
        // Registered before the push so a fast worker cannot beat us to it
        let handle = self.inner.register_call(&mut job, timeout)?;

        if let Err(e) = self.inner.push(&link, &job).await {
            if let Some((_, call)) = self.inner.correlator.pending.remove(&job.id) {
                call.timer.abort();
            }
            return Err(e);
        }

        tracing::info!(
            job_id = %job.id,
            user_id = ?job.user_id,
            timeout_ms = timeout.as_millis() as u64,
            "Job sent to remote worker"
        );
        Ok(handle)
    }

    /// [`Broker::request`] and wait for the outcome
    pub async fn enqueue_and_wait(&self, job: Job<P>, timeout: Duration) -> DispatchResult<Value> {
        self.request(job, timeout).await?.await
    }

    /// Whether a worker heartbeat is younger than the liveness window
    pub async fn has_active_worker(&self) -> bool {
        let Some(link) = self.inner.current_link() else {
            return false;
        };
        let key = &self.inner.config.keys.heartbeat;

        let last_seen = match link.queue.get(key).await {
            Ok(Some(raw)) => raw.trim().parse::<i64>().ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(error = %e, "Heartbeat lookup failed");
                None
            }
        };

        let window = self.inner.config.liveness_window().as_millis() as i64;
        last_seen.is_some_and(|ts| Utc::now().timestamp_millis() - ts < window)
    }

    /// Queue depth and worker liveness; a snapshot, not a guarantee
    pub async fn queue_stats(&self) -> QueueStats {
        let awaiting = self.inner.correlator.pending.len();
        let Some(link) = self.inner.current_link() else {
            return QueueStats {
                pending: 0,
                has_worker: false,
                awaiting,
            };
        };

        let pending = match link.queue.len(&self.inner.config.keys.queue).await {
            Ok(len) => len,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read queue depth");
                0
            }
        };

        QueueStats {
            pending,
            has_worker: self.has_active_worker().await,
            awaiting,
        }
    }

    /// Release the queue link and its subscription.
    ///
    /// Every caller still waiting settles with `Unavailable`. Safe to call
    /// when not connected.
    pub async fn disconnect(&self) {
        let _guard = self.inner.connecting.lock().await;
        let link = self
            .inner
            .link
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let abandoned = self.inner.correlator.abandon_all("broker disconnected");
        if let Some(link) = link {
            link.listener.abort();
            link.queue.close().await;
            tracing::info!(abandoned, "Broker disconnected");
        }
    }

    /// Results of jobs sent with [`Broker::enqueue`]
    pub fn completions(&self) -> broadcast::Receiver<TaskResult> {
        self.inner.correlator.completions.subscribe()
    }

    pub fn stats(&self) -> BrokerStats {
        self.inner.correlator.stats()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }
}

impl<P> BrokerInner<P> {
    fn current_link(&self) -> Option<Arc<Link>> {
        self.link.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl<P> BrokerInner<P>
where
    P: Serialize + Send + Sync + 'static,
{
    async fn establish(&self, queue: Arc<dyn DurableQueue>) -> QueueResult<()> {
        let results = queue.subscribe(&self.config.keys.results).await?;
        let generation = self.link_generation.fetch_add(1, Ordering::Relaxed) + 1;

        // Held until the link is stored so a listener that ends at once still finds it
        let mut slot = self.link.write().unwrap_or_else(|e| e.into_inner());
        let listener = tokio::spawn(listen(
            results,
            Arc::clone(&self.correlator),
            Arc::clone(&self.link),
            generation,
        ));
        *slot = Some(Arc::new(Link {
            queue,
            listener,
            generation,
        }));
        drop(slot);

        tracing::info!(
            queue = %self.config.keys.queue,
            results = %self.config.keys.results,
            "Broker connected"
        );
        Ok(())
    }

    /// Validate and require a link
    fn admit(&self, job: &Job<P>) -> DispatchResult<Arc<Link>> {
        if let Err(reason) = self.validator.validate(&job.payload) {
            self.correlator.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(job_id = %job.id, reason = %reason, "Rejecting invalid job");
            return Err(DispatchError::AdmissionRejected(reason));
        }

        self.current_link()
            .ok_or_else(|| DispatchError::Unavailable("broker not connected".to_string()))
    }

    /// Install a pending call, regenerating the job id while it collides
    /// with one already tracked
    fn register_call(&self, job: &mut Job<P>, timeout: Duration) -> DispatchResult<JobHandle<Value>> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let (settle, handle) = JobHandle::channel(job.id.clone());
            if self.correlator.register(job.id.clone(), settle, timeout) {
                return Ok(handle);
            }
            tracing::debug!(job_id = %job.id, "Job id already tracked, regenerating");
            job.regenerate_id();
        }
        Err(self.id_exhausted(job))
    }

    /// Track the job as detached under an id nobody else holds
    fn claim_detached(&self, job: &mut Job<P>) -> DispatchResult<()> {
        for _ in 0..MAX_ID_ATTEMPTS {
            if self.correlator.claim_detached(&job.id) {
                return Ok(());
            }
            tracing::debug!(job_id = %job.id, "Job id already tracked, regenerating");
            job.regenerate_id();
        }
        Err(self.id_exhausted(job))
    }

    fn id_exhausted(&self, job: &Job<P>) -> DispatchError {
        self.correlator.rejected.fetch_add(1, Ordering::Relaxed);
        DispatchError::AdmissionRejected(format!("could not allocate a unique id for job {}", job.id))
    }

    async fn push(&self, link: &Link, job: &Job<P>) -> DispatchResult<()> {
        let payload = serde_json::to_string(job)
            .map_err(|e| DispatchError::AdmissionRejected(format!("job is not serializable: {}", e)))?;

        link.queue
            .push(&self.config.keys.queue, payload)
            .await
            .map_err(|e| {
                tracing::error!(job_id = %job.id, error = %e, "Failed to push job");
                DispatchError::from(e)
            })?;

        self.correlator.enqueued.fetch_add(1, Ordering::Relaxed);
        self.correlator.prune();
        Ok(())
    }
}

impl Correlator {
    fn is_tracked(&self, id: &str) -> bool {
        self.pending.contains_key(id) || self.detached.contains_key(id) || self.expired.contains_key(id)
    }

    /// Install a pending call with its timer. False if `id` is taken.
    fn register(self: &Arc<Self>, id: JobId, settle: Settle<Value>, timeout: Duration) -> bool {
        match self.pending.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot)
                if self.detached.contains_key(slot.key()) || self.expired.contains_key(slot.key()) =>
            {
                false
            }
            Entry::Vacant(slot) => {
                let correlator = Arc::clone(self);
                let id = slot.key().clone();
                // The timer blocks on this shard until the insert below is done
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    correlator.expire(&id, timeout);
                })
                .abort_handle();
                slot.insert(PendingCall { settle, timer });
                true
            }
        }
    }

    /// Mark `id` as detached. False if `id` is taken.
    fn claim_detached(&self, id: &str) -> bool {
        if self.is_tracked(id) {
            return false;
        }
        match self.detached.entry(id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                true
            }
        }
    }

    fn expire(&self, id: &str, after: Duration) {
        let Some((id, call)) = self.pending.remove(id) else {
            return;
        };
        self.timed_out.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            job_id = %id,
            timeout_ms = after.as_millis() as u64,
            "Remote job timed out, a late result will be dropped"
        );
        self.expired.insert(id, Instant::now());
        let _ = call.settle.send(Err(DispatchError::TimedOut(after)));
    }

    fn handle_message(&self, raw: &str) {
        let result: TaskResult = match serde_json::from_str(raw) {
            Ok(result) => result,
            Err(e) => {
                self.parse_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "Dropping unparseable result message");
                return;
            }
        };
        self.deliver(result);
    }

    fn deliver(&self, result: TaskResult) {
        if let Some((id, call)) = self.pending.remove(&result.id) {
            call.timer.abort();
            self.delivered.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(job_id = %id, success = result.success, "Result delivered");

            let outcome = if result.success {
                Ok(result.data.unwrap_or(Value::Null))
            } else {
                Err(DispatchError::ExecutionFailed(
                    result
                        .error_message
                        .unwrap_or_else(|| "remote worker reported a failure".to_string()),
                ))
            };
            // The caller may have dropped its handle
            let _ = call.settle.send(outcome);
            return;
        }

        if self.detached.remove(&result.id).is_some() {
            self.delivered_detached.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(job_id = %result.id, success = result.success, "Detached result received");
            let _ = self.completions.send(result);
            return;
        }

        if self.expired.remove(&result.id).is_some() {
            self.dropped_late.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(job_id = %result.id, "Dropping result that arrived after its timeout");
        } else {
            self.dropped_unknown.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(job_id = %result.id, "Dropping result for unknown job");
        }
    }

    /// Settle every waiting caller with `Unavailable`
    fn abandon_all(&self, reason: &str) -> usize {
        let ids: Vec<JobId> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        let mut abandoned = 0;
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                call.timer.abort();
                let _ = call
                    .settle
                    .send(Err(DispatchError::Unavailable(reason.to_string())));
                abandoned += 1;
            }
        }
        self.detached.clear();
        abandoned
    }

    /// Forget detached and expired ids older than the retention period
    fn prune(&self) {
        let now = Instant::now();
        let retention = self.retention;
        self.detached.retain(|_, since| now.duration_since(*since) < retention);
        self.expired.retain(|_, since| now.duration_since(*since) < retention);
    }

    fn stats(&self) -> BrokerStats {
        BrokerStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            delivered_detached: self.delivered_detached.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            dropped_late: self.dropped_late.load(Ordering::Relaxed),
            dropped_unknown: self.dropped_unknown.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            awaiting: self.pending.len(),
            detached: self.detached.len(),
        }
    }
}

/// Route results until the subscription ends, then drop the link it
/// belongs to so the next connect opens a fresh one
async fn listen(mut results: Subscription, correlator: Arc<Correlator>, slot: LinkSlot, generation: u64) {
    while let Some(raw) = results.recv().await {
        correlator.handle_message(&raw);
    }

    let stale = {
        let mut slot = slot.write().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(link) if link.generation == generation => slot.take(),
            _ => None,
        }
    };
    let Some(stale) = stale else {
        return;
    };

    let abandoned = correlator.abandon_all("result subscription ended");
    tracing::error!(abandoned, "Result subscription ended, remote execution unavailable until reconnect");
    // Dropping the link aborts this task
    drop(stale);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryQueue, SUBSCRIPTION_CAPACITY};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use trackrelay_shared_config::QueueKeys;
    use tracing_test::traced_test;

    fn test_config() -> BrokerConfig {
        BrokerConfig::default().with_keys(QueueKeys::with_prefix("test"))
    }

    async fn connected(queue: &InMemoryQueue) -> Broker<Value> {
        let broker = Broker::new(test_config());
        let queue = queue.clone();
        assert!(broker.connect_with(move || {
            let queue = queue.clone();
            async move { QueueResult::Ok(queue) }
        })
        .await);
        broker
    }

    #[tokio::test]
    async fn test_not_connected_is_unavailable() {
        let broker: Broker<Value> = Broker::new(test_config());
        assert!(!broker.connect(None).await);
        let err = broker.enqueue(Job::new(json!({}))).await.unwrap_err();
        assert_eq!(err, DispatchError::Unavailable("broker not connected".into()));
        assert!(!broker.has_active_worker().await);
    }

    #[tokio::test]
    async fn test_colliding_id_is_regenerated() {
        let queue = InMemoryQueue::new();
        let broker = connected(&queue).await;

        let first = Job::new(json!({"n": 1}));
        let mut second = Job::new(json!({"n": 2}));
        second.id = first.id.clone();

        let a = broker.enqueue(first).await.unwrap();
        let b = broker.enqueue(second).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(queue.len("test:queue").await.unwrap(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unparseable_result_is_counted() {
        let broker: Broker<Value> = Broker::new(test_config());
        broker.inner.correlator.handle_message("not json");
        broker.inner.correlator.handle_message(r#"{"id":"task_1"}"#);

        assert_eq!(broker.stats().parse_failures, 2);
        assert_eq!(broker.stats().dropped_unknown, 0);
        assert!(logs_contain("Dropping unparseable result message"));
    }

    #[tokio::test]
    async fn test_unknown_result_is_dropped() {
        let queue = InMemoryQueue::new();
        let broker = connected(&queue).await;

        let stray = TaskResult::success("task_0_stray", json!(1));
        queue
            .publish("test:results", serde_json::to_string(&stray).unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = broker.stats();
        assert_eq!(stats.dropped_unknown, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test]
    async fn test_request_regenerates_id_taken_concurrently() {
        let queue = InMemoryQueue::new();
        let broker = connected(&queue).await;

        let mut job = Job::new(json!({}));
        let taken = job.id.clone();
        let (settle, _first) = JobHandle::channel(taken.clone());
        // Another request claims the id between admission and registration
        assert!(broker
            .inner
            .correlator
            .register(taken.clone(), settle, Duration::from_secs(60)));

        let handle = broker
            .inner
            .register_call(&mut job, Duration::from_secs(60))
            .unwrap();
        assert_ne!(job.id, taken);
        assert_eq!(handle.id(), job.id);
        assert_eq!(broker.stats().awaiting, 2);
    }

    #[tokio::test]
    async fn test_detached_id_is_not_reused_for_request() {
        let queue = InMemoryQueue::new();
        let broker = connected(&queue).await;

        let detached = broker.enqueue(Job::new(json!({}))).await.unwrap();
        let mut job = Job::new(json!({}));
        job.id = detached.clone();

        let handle = broker.request(job, Duration::from_secs(60)).await.unwrap();
        assert_ne!(handle.id(), detached);
    }

    /// Queue whose result subscriptions can be ended from the test
    #[derive(Clone, Default)]
    struct EndingSubscriptions {
        inner: InMemoryQueue,
        opens: Arc<AtomicUsize>,
        feeds: Arc<std::sync::Mutex<Vec<mpsc::Sender<String>>>>,
    }

    impl EndingSubscriptions {
        fn end_all(&self) {
            self.feeds.lock().unwrap().clear();
        }

        async fn feed(&self, result: &TaskResult) {
            let feed = self.feeds.lock().unwrap().last().cloned().unwrap();
            feed.send(serde_json::to_string(result).unwrap()).await.unwrap();
        }

        async fn connect(&self, broker: &Broker<Value>) -> bool {
            broker
                .connect_with(|| {
                    self.opens.fetch_add(1, Ordering::SeqCst);
                    let queue = self.clone();
                    async move { QueueResult::Ok(queue) }
                })
                .await
        }
    }

    #[async_trait]
    impl DurableQueue for EndingSubscriptions {
        async fn push(&self, queue: &str, payload: String) -> QueueResult<()> {
            self.inner.push(queue, payload).await
        }

        async fn blocking_pop(&self, queue: &str, timeout: Duration) -> QueueResult<Option<String>> {
            self.inner.blocking_pop(queue, timeout).await
        }

        async fn len(&self, queue: &str) -> QueueResult<usize> {
            self.inner.len(queue).await
        }

        async fn publish(&self, channel: &str, payload: String) -> QueueResult<()> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, _channel: &str) -> QueueResult<Subscription> {
            let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
            self.feeds.lock().unwrap().push(tx);
            Ok(rx)
        }

        async fn set_with_expiry(&self, key: &str, value: String, ttl: Duration) -> QueueResult<()> {
            self.inner.set_with_expiry(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> QueueResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_ended_subscription_drops_link() {
        let queue = EndingSubscriptions::default();
        let broker: Broker<Value> = Broker::new(test_config());
        assert!(queue.connect(&broker).await);

        let waiting = broker
            .request(Job::new(json!({})), Duration::from_secs(600))
            .await
            .unwrap();
        queue.end_all();

        let err = waiting.await.unwrap_err();
        assert_eq!(err, DispatchError::Unavailable("result subscription ended".into()));
        assert!(!broker.is_connected());
        assert!(!broker.has_active_worker().await);
        assert_matches::assert_matches!(
            broker.request(Job::new(json!({})), Duration::from_secs(600)).await,
            Err(DispatchError::Unavailable(_))
        );

        // The next connect opens a fresh link instead of reusing the dead one
        assert!(queue.connect(&broker).await);
        assert_eq!(queue.opens.load(Ordering::SeqCst), 2);

        let handle = broker
            .request(Job::new(json!({})), Duration::from_secs(600))
            .await
            .unwrap();
        queue
            .feed(&TaskResult::success(handle.id(), json!("done")))
            .await;
        assert_eq!(handle.await.unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_subscription_dead_on_connect() {
        let queue = EndingSubscriptions::default();
        let broker: Broker<Value> = Broker::new(test_config());
        assert!(queue.connect(&broker).await);
        queue.end_all();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!broker.is_connected());
        let err = broker
            .enqueue_and_wait(Job::new(json!({})), Duration::from_secs(600))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Unavailable("broker not connected".into()));
    }

    #[tokio::test]
    async fn test_prune_forgets_old_ids() {
        let correlator = Broker::<Value>::new(BrokerConfig {
            retention_secs: 0,
            ..test_config()
        })
        .inner
        .correlator
        .clone();
        correlator.detached.insert("task_1".into(), Instant::now());
        correlator.expired.insert("task_2".into(), Instant::now());
        correlator.prune();
        assert!(!correlator.is_tracked("task_1"));
        assert!(!correlator.is_tracked("task_2"));
    }
}
