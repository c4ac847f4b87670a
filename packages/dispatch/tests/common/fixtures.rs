//! Test fixtures: payloads, configs, gated processors and a running worker

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trackrelay_dispatch::{
    Broker, DurableQueue, InMemoryQueue, JobProcessor, QueueResult, WorkerLoop, WorkerStats,
};
use trackrelay_shared_config::{BrokerConfig, QueueKeys, SchedulerConfig, WorkerLoopConfig};

/// Payload shaped like a download request from the bot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
}

impl DownloadRequest {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

/// Rejects requests without a url, as the bot does before queueing
pub fn require_url(request: &DownloadRequest) -> Result<(), String> {
    if request.url.trim().is_empty() {
        return Err("missing url".to_string());
    }
    Ok(())
}

pub fn test_keys() -> QueueKeys {
    QueueKeys::with_prefix("test")
}

pub fn scheduler_config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig::default().with_max_concurrent(max_concurrent)
}

/// Scheduler config that queues everything until `resume`
pub fn paused_config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        start_paused: true,
        ..scheduler_config(max_concurrent)
    }
}

pub fn broker_config() -> BrokerConfig {
    BrokerConfig::default().with_keys(test_keys())
}

/// Fast worker timings; the per-job limit is off unless a test sets it
pub fn worker_config() -> WorkerLoopConfig {
    WorkerLoopConfig {
        keys: test_keys(),
        pop_timeout_secs: 1,
        heartbeat_interval_secs: 1,
        heartbeat_ttl_secs: 5,
        job_timeout_secs: 0,
        error_backoff_secs: 1,
        publish_attempts: 3,
    }
}

/// A broker connected to `queue`
pub async fn connect_broker<P>(queue: &InMemoryQueue) -> Broker<P>
where
    P: Serialize + Send + Sync + 'static,
{
    let broker = Broker::new(broker_config());
    attach(&broker, queue).await;
    broker
}

pub async fn attach<P>(broker: &Broker<P>, queue: &InMemoryQueue)
where
    P: Serialize + Send + Sync + 'static,
{
    let queue = queue.clone();
    let connected = broker
        .connect_with(move || {
            let queue = queue.clone();
            async move { QueueResult::Ok(queue) }
        })
        .await;
    assert!(connected, "in-memory broker should always connect");
}

/// Records the order in which jobs start executing
#[derive(Debug, Clone, Default)]
pub struct StartLog(Arc<Mutex<Vec<u32>>>);

impl StartLog {
    pub fn record(&self, label: u32) {
        self.0.lock().unwrap().push(label);
    }

    pub fn snapshot(&self) -> Vec<u32> {
        self.0.lock().unwrap().clone()
    }
}

/// Holds every job at its start until a permit is released for it
#[derive(Debug, Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    pub fn closed() -> Self {
        Self(Arc::new(Semaphore::new(0)))
    }

    pub fn release(&self, jobs: usize) {
        self.0.add_permits(jobs);
    }

    pub async fn pass(&self) {
        self.0.acquire().await.unwrap().forget();
    }
}

/// A worker loop running in the background
pub struct RunningWorker<P, O> {
    pub worker: Arc<WorkerLoop<P, O>>,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<WorkerStats>,
}

impl<P, O> RunningWorker<P, O> {
    pub async fn stop(self) -> WorkerStats {
        self.shutdown.cancel();
        self.task.await.unwrap()
    }
}

/// Start a worker on `queue`; its first heartbeat is written before this
/// returns
pub async fn spawn_worker<P, O>(
    queue: &InMemoryQueue,
    config: WorkerLoopConfig,
    processor: impl JobProcessor<P, O>,
) -> RunningWorker<P, O>
where
    P: serde::de::DeserializeOwned + Send + Sync + 'static,
    O: Serialize + Send + Sync + 'static,
{
    let shared: Arc<dyn DurableQueue> = Arc::new(queue.clone());
    let worker = Arc::new(WorkerLoop::new(shared, processor, config));
    worker.send_heartbeat().await.unwrap();

    let shutdown = CancellationToken::new();
    let task = {
        let worker = Arc::clone(&worker);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.run(shutdown).await })
    };

    RunningWorker {
        worker,
        shutdown,
        task,
    }
}

/// Let spawned tasks run; under a paused clock this also advances time
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
