//! Job dispatch for trackrelay
//!
//! Two ways to run a [`Job`]:
//!
//! - [`LocalScheduler`]: in-process priority queue with a concurrency limit
//!   and a per-job timeout.
//! - [`Broker`] and [`WorkerLoop`]: the broker pushes jobs onto a
//!   [`DurableQueue`] and correlates the results a worker process publishes
//!   back. Worker liveness comes from a heartbeat key.
//!
//! [`HybridDispatcher`] chooses between the two per job.
//!
//! ```no_run
//! use trackrelay_dispatch::{Job, LocalScheduler};
//! use trackrelay_shared_config::SchedulerConfig;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let scheduler = LocalScheduler::new(
//!     |job: Job<String>| async move { anyhow::Ok(job.payload.len()) },
//!     &SchedulerConfig::default(),
//! );
//! let length = scheduler.submit(Job::new("hello".to_string()))?.await?;
//! assert_eq!(length, 5);
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod error;
pub mod handle;
pub mod hybrid;
pub mod job;
pub mod processor;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use broker::{Broker, BrokerStats, QueueStats};
pub use error::{DispatchError, DispatchResult, ErrorSeverity, QueueError, QueueResult};
pub use handle::{DrainSignal, JobHandle};
pub use hybrid::{HybridDispatcher, HybridStats, Route};
pub use job::{generate_job_id, AcceptAll, Job, JobId, JobValidator, TaskResult};
pub use processor::JobProcessor;
pub use queue::{DurableQueue, InMemoryQueue, RedisQueue, Subscription};
pub use scheduler::{LocalScheduler, SchedulerStats};
pub use worker::{WorkerLoop, WorkerStats};
