//! Remote worker loop
//!
//! Pops one job at a time from the durable queue, runs it through the
//! processor and publishes a result for it no matter how the processor
//! ended. A heartbeat task runs alongside, independent of job arrival.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use trackrelay_shared_config::WorkerLoopConfig;

use crate::error::{QueueError, QueueResult};
use crate::job::{Job, TaskResult};
use crate::processor::{describe_join_error, JobProcessor};
use crate::queue::DurableQueue;

/// Counters for one worker loop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub malformed: u64,
    /// Results that could not be published after every attempt
    pub lost_results: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    malformed: AtomicU64,
    lost_results: AtomicU64,
}

pub struct WorkerLoop<P, O> {
    queue: Arc<dyn DurableQueue>,
    processor: Arc<dyn JobProcessor<P, O>>,
    config: WorkerLoopConfig,
    counters: Counters,
}

impl<P, O> std::fmt::Debug for WorkerLoop<P, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLoop")
            .field("queue", &self.config.keys.queue)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<P, O> WorkerLoop<P, O> {
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            lost_results: self.counters.lost_results.load(Ordering::Relaxed),
        }
    }
}

impl<P, O> WorkerLoop<P, O>
where
    P: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        processor: impl JobProcessor<P, O>,
        config: WorkerLoopConfig,
    ) -> Self {
        Self {
            queue,
            processor: Arc::new(processor),
            config,
            counters: Counters::default(),
        }
    }

    /// Run until `shutdown` is cancelled or the queue is closed.
    ///
    /// A blocking pop in progress is never abandoned, since that could lose
    /// a job already taken off the queue; shutdown is noticed between pops,
    /// at most one pop timeout late. A job in progress always finishes and
    /// has its result published.
    pub async fn run(&self, shutdown: CancellationToken) -> WorkerStats {
        let heartbeat_stop = shutdown.child_token();
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.queue),
            self.config.keys.heartbeat.clone(),
            self.config.heartbeat_interval(),
            self.config.heartbeat_ttl(),
            heartbeat_stop.clone(),
        ));

        tracing::info!(
            queue = %self.config.keys.queue,
            pop_timeout_secs = self.config.pop_timeout_secs,
            "Worker loop started, waiting for jobs"
        );

        while !shutdown.is_cancelled() {
            match self
                .queue
                .blocking_pop(&self.config.keys.queue, self.config.pop_timeout())
                .await
            {
                Ok(Some(raw)) => self.handle(&raw).await,
                Ok(None) => tracing::trace!("No job within pop timeout"),
                Err(QueueError::Closed) => {
                    tracing::info!("Queue closed, stopping worker loop");
                    break;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        backoff_secs = self.config.error_backoff_secs,
                        "Failed to pop job"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(Duration::from_secs(self.config.error_backoff_secs)) => {}
                    }
                }
            }
        }

        heartbeat_stop.cancel();
        if let Err(e) = heartbeat.await {
            tracing::warn!(error = %e, "Heartbeat task ended abnormally");
        }

        let stats = self.stats();
        tracing::info!(
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "Worker loop stopped"
        );
        stats
    }

    /// Record this worker as alive for one heartbeat TTL
    pub async fn send_heartbeat(&self) -> QueueResult<()> {
        write_heartbeat(
            self.queue.as_ref(),
            &self.config.keys.heartbeat,
            self.config.heartbeat_ttl(),
        )
        .await
    }

    /// Execute one raw job and publish its result
    async fn handle(&self, raw: &str) {
        let job: Job<P> = match serde_json::from_str(raw) {
            Ok(job) => job,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                match salvage_id(raw) {
                    Some(id) => {
                        tracing::warn!(job_id = %id, error = %e, "Malformed job, reporting failure");
                        self.publish(TaskResult::failure(id, format!("malformed job: {}", e)))
                            .await;
                    }
                    None => tracing::error!(error = %e, "Discarding job without a readable id"),
                }
                return;
            }
        };

        let job_id = job.id.clone();
        let age = job.age();
        tracing::info!(
            job_id = %job_id,
            user_id = ?job.user_id,
            priority = job.priority,
            wait_ms = age.as_millis() as u64,
            "Processing job"
        );

        let started = tokio::time::Instant::now();
        let mut work = tokio::spawn(self.processor.process(job));
        let finished = match self.config.job_timeout() {
            Some(limit) => match tokio::time::timeout(limit, &mut work).await {
                Ok(finished) => finished,
                Err(_) => {
                    work.abort();
                    self.record(false);
                    tracing::error!(job_id = %job_id, timeout_secs = limit.as_secs(), "Job timed out");
                    self.publish(TaskResult::failure(
                        job_id,
                        format!("job timed out after {}s", limit.as_secs()),
                    ))
                    .await;
                    return;
                }
            },
            None => (&mut work).await,
        };

        let result = match finished {
            Ok(Ok(output)) => match serde_json::to_value(output) {
                Ok(data) => TaskResult::success(job_id.clone(), data),
                Err(e) => TaskResult::failure(job_id.clone(), format!("unserializable output: {}", e)),
            },
            Ok(Err(err)) => TaskResult::failure(job_id.clone(), format!("{:#}", err)),
            Err(join_err) => TaskResult::failure(job_id.clone(), describe_join_error(join_err)),
        };

        self.record(result.success);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result.error_message {
            None => tracing::info!(job_id = %job_id, elapsed_ms, "Job succeeded"),
            Some(error) => tracing::error!(job_id = %job_id, elapsed_ms, error = %error, "Job failed"),
        }

        self.publish(result).await;
    }

    fn record(&self, success: bool) {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        if success {
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Publish with retries; a result that never gets out is a lost job
    async fn publish(&self, result: TaskResult) {
        let payload = match serde_json::to_string(&result) {
            Ok(payload) => payload,
            Err(e) => {
                self.counters.lost_results.fetch_add(1, Ordering::Relaxed);
                tracing::error!(job_id = %result.id, error = %e, "Failed to serialize result");
                return;
            }
        };

        let attempts = self.config.publish_attempts.max(1);
        for attempt in 1..=attempts {
            match self
                .queue
                .publish(&self.config.keys.results, payload.clone())
                .await
            {
                Ok(()) => return,
                Err(e) if attempt < attempts => {
                    tracing::warn!(job_id = %result.id, attempt, error = %e, "Result publish failed, retrying");
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
                Err(e) => {
                    tracing::error!(job_id = %result.id, attempts, error = %e, "Result lost, giving up");
                }
            }
        }
        self.counters.lost_results.fetch_add(1, Ordering::Relaxed);
    }
}

/// Read the id out of a job that failed to decode as a whole
fn salvage_id(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    value
        .get("id")
        .or_else(|| value.get("taskId"))
        .and_then(|id| id.as_str())
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}

async fn write_heartbeat(queue: &dyn DurableQueue, key: &str, ttl: Duration) -> QueueResult<()> {
    let now = Utc::now().timestamp_millis();
    queue.set_with_expiry(key, now.to_string(), ttl).await
}

async fn heartbeat_loop(
    queue: Arc<dyn DurableQueue>,
    key: String,
    every: Duration,
    ttl: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                match write_heartbeat(queue.as_ref(), &key, ttl).await {
                    Ok(()) => tracing::trace!("Heartbeat sent"),
                    Err(QueueError::Closed) => break,
                    Err(e) => tracing::warn!(error = %e, "Failed to send heartbeat"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salvage_id() {
        assert_eq!(
            salvage_id(r#"{"id":"task_1_abc","payload":42}"#),
            Some("task_1_abc".to_string())
        );
        assert_eq!(
            salvage_id(r#"{"taskId":"task_2_abc"}"#),
            Some("task_2_abc".to_string())
        );
        assert_eq!(salvage_id(r#"{"id":""}"#), None);
        assert_eq!(salvage_id(r#"{"id":7}"#), None);
        assert_eq!(salvage_id("not json"), None);
    }
}
