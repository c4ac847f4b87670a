//! In-process priority scheduler with bounded concurrency
//!
//! Jobs wait in a single ordered queue: higher priority first, arrival order
//! among equals. Up to `limit` jobs execute at once, each raced against the
//! job timeout. Dispatch is re-entered from the completion path itself, so a
//! freed slot is reused before the completion returns; there is no polling
//! timer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use trackrelay_shared_config::SchedulerConfig;

use crate::error::{DispatchError, DispatchResult};
use crate::handle::{DrainSignal, JobHandle, Settle};
use crate::job::{AcceptAll, Job, JobValidator};
use crate::processor::{describe_join_error, JobProcessor};

/// Snapshot of scheduler counters and occupancy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub cleared: u64,
    pub queued: usize,
    pub active: usize,
    pub paused: bool,
    pub concurrency_limit: usize,
}

/// Bounded-concurrency priority executor.
///
/// Cloning yields another handle to the same scheduler. All methods that may
/// start jobs (`submit`, `resume`, `set_concurrency_limit`) must be called
/// from within a tokio runtime.
pub struct LocalScheduler<P, O> {
    inner: Arc<Inner<P, O>>,
}

impl<P, O> Clone for LocalScheduler<P, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, O> std::fmt::Debug for LocalScheduler<P, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalScheduler")
            .field("stats", &self.inner.lock().stats())
            .finish()
    }
}

struct Inner<P, O> {
    state: Mutex<State<P, O>>,
    processor: Arc<dyn JobProcessor<P, O>>,
    validator: Box<dyn JobValidator<P>>,
    job_timeout: Duration,
    slow_wait: Duration,
    slow_run: Duration,
}

struct State<P, O> {
    queue: VecDeque<Queued<P, O>>,
    active: usize,
    limit: usize,
    paused: bool,
    idle_waiters: Vec<oneshot::Sender<()>>,
    completed: u64,
    failed: u64,
    timed_out: u64,
    rejected: u64,
    cleared: u64,
}

struct Queued<P, O> {
    job: Job<P>,
    settle: Settle<O>,
    queued_at: Instant,
}

impl<P, O> State<P, O> {
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.active == 0
    }

    fn wake_idle_waiters(&mut self) {
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            completed: self.completed,
            failed: self.failed,
            timed_out: self.timed_out,
            rejected: self.rejected,
            cleared: self.cleared,
            queued: self.queue.len(),
            active: self.active,
            paused: self.paused,
            concurrency_limit: self.limit,
        }
    }
}

impl<P, O> LocalScheduler<P, O>
where
    P: Send + 'static,
    O: Send + 'static,
{
    pub fn new(processor: impl JobProcessor<P, O>, config: &SchedulerConfig) -> Self {
        Self::with_validator(processor, config, AcceptAll)
    }

    /// Scheduler that rejects payloads the validator refuses, before queueing
    pub fn with_validator(
        processor: impl JobProcessor<P, O>,
        config: &SchedulerConfig,
        validator: impl JobValidator<P> + 'static,
    ) -> Self {
        let limit = config.max_concurrent.max(1);
        tracing::info!(
            max_concurrent = limit,
            job_timeout_secs = config.job_timeout_secs,
            "Local scheduler created"
        );

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    active: 0,
                    limit,
                    paused: config.start_paused,
                    idle_waiters: Vec::new(),
                    completed: 0,
                    failed: 0,
                    timed_out: 0,
                    rejected: 0,
                    cleared: 0,
                }),
                processor: Arc::new(processor),
                validator: Box::new(validator),
                job_timeout: config.job_timeout(),
                slow_wait: config.slow_wait(),
                slow_run: config.slow_run(),
            }),
        }
    }

    /// Queue a job.
    ///
    /// Fails with [`DispatchError::AdmissionRejected`] without queueing if the
    /// validator refuses the payload. Otherwise the job is placed after every
    /// queued job of greater or equal priority.
    pub fn submit(&self, job: Job<P>) -> DispatchResult<JobHandle<O>> {
        if let Err(reason) = self.inner.validator.validate(&job.payload) {
            self.inner.lock().rejected += 1;
            tracing::warn!(
                job_id = %job.id,
                user_id = ?job.user_id,
                reason = %reason,
                "Dropping invalid job"
            );
            return Err(DispatchError::AdmissionRejected(reason));
        }

        let (settle, handle) = JobHandle::channel(job.id.clone());
        let mut state = self.inner.lock();

        let position = state
            .queue
            .iter()
            .position(|queued| queued.job.priority < job.priority)
            .unwrap_or(state.queue.len());

        tracing::debug!(
            job_id = %job.id,
            priority = job.priority,
            position,
            queued = state.queue.len() + 1,
            "Job queued"
        );

        state.queue.insert(
            position,
            Queued {
                job,
                settle,
                queued_at: Instant::now(),
            },
        );
        self.inner.dispatch(&mut state);

        Ok(handle)
    }

    /// Stop starting new jobs; running jobs are unaffected
    pub fn pause(&self) {
        let mut state = self.inner.lock();
        if !state.paused {
            state.paused = true;
            tracing::info!(queued = state.queue.len(), "Local scheduler paused");
        }
    }

    /// Start pulling queued jobs again
    pub fn resume(&self) {
        let mut state = self.inner.lock();
        if state.paused {
            state.paused = false;
            tracing::info!(queued = state.queue.len(), "Local scheduler resumed");
            self.inner.dispatch(&mut state);
        }
    }

    /// Change the concurrency limit (minimum 1). Lowering it never aborts
    /// running jobs; it only throttles what starts next.
    pub fn set_concurrency_limit(&self, limit: usize) {
        let mut state = self.inner.lock();
        state.limit = limit.max(1);
        tracing::info!(max_concurrent = state.limit, "Concurrency limit updated");
        self.inner.dispatch(&mut state);
    }

    /// Reject every queued job with [`DispatchError::Cleared`]
    pub fn cancel_all(&self) -> usize {
        let removed = self
            .inner
            .cancel_where("queue cleared by admin", |_| true);
        tracing::info!(removed, "Queue cleared");
        removed
    }

    /// Reject the queued jobs tagged with `user_id`; running jobs continue
    pub fn cancel_by_tag(&self, user_id: i64) -> usize {
        let removed = self
            .inner
            .cancel_where("jobs for user cleared by admin", |job| {
                job.user_id == Some(user_id)
            });
        if removed > 0 {
            tracing::info!(removed, user_id, "Cleared queued jobs for user");
        }
        removed
    }

    /// Resolves once the queue is empty and nothing is executing.
    ///
    /// Every waiter registered before the idle transition is released
    /// together. A job submitted after this call keeps the signal pending
    /// until that job settles too.
    pub fn drain_signal(&self) -> DrainSignal {
        let mut state = self.inner.lock();
        if state.is_idle() {
            return DrainSignal::ready();
        }
        let (tx, rx) = oneshot::channel();
        state.idle_waiters.push(tx);
        DrainSignal::waiting(rx)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.lock().stats()
    }

    /// Number of queued (not yet executing) jobs
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Number of executing jobs
    pub fn active(&self) -> usize {
        self.inner.lock().active
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }
}

impl<P, O> Inner<P, O> {
    fn lock(&self) -> MutexGuard<'_, State<P, O>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancel_where(&self, reason: &str, mut matches: impl FnMut(&Job<P>) -> bool) -> usize {
        let mut state = self.lock();
        let (removed, kept): (VecDeque<_>, VecDeque<_>) = state
            .queue
            .drain(..)
            .partition(|queued| matches(&queued.job));
        state.queue = kept;

        let count = removed.len();
        state.cleared += count as u64;
        for queued in removed {
            let _ = queued
                .settle
                .send(Err(DispatchError::Cleared(reason.to_string())));
        }

        if count > 0 && state.is_idle() {
            state.wake_idle_waiters();
        }
        count
    }
}

impl<P, O> Inner<P, O>
where
    P: Send + 'static,
    O: Send + 'static,
{
    /// Start queued jobs until the limit is reached. Called with the state
    /// lock held.
    fn dispatch(self: &Arc<Self>, state: &mut State<P, O>) {
        if state.paused {
            return;
        }
        while state.active < state.limit {
            let Some(next) = state.queue.pop_front() else {
                break;
            };
            state.active += 1;
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.execute(next).await });
        }
    }

    async fn execute(self: Arc<Self>, queued: Queued<P, O>) {
        let Queued {
            job,
            settle,
            queued_at,
        } = queued;
        let job_id = job.id.clone();
        let user_id = job.user_id;

        let waited = queued_at.elapsed();
        if waited > self.slow_wait {
            tracing::warn!(
                job_id = %job_id,
                user_id = ?user_id,
                wait_ms = waited.as_millis() as u64,
                "Job waited a long time in queue"
            );
        }

        let started = Instant::now();
        // Own task so a panicking processor cannot take the scheduler with it
        let mut work = tokio::spawn(self.processor.process(job));

        let outcome = match tokio::time::timeout(self.job_timeout, &mut work).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(DispatchError::execution(&err)),
            Ok(Err(join_err)) => Err(DispatchError::ExecutionFailed(describe_join_error(
                join_err,
            ))),
            Err(_) => {
                work.abort();
                Err(DispatchError::TimedOut(self.job_timeout))
            }
        };

        let elapsed = started.elapsed();
        match &outcome {
            Ok(_) if elapsed > self.slow_run => tracing::info!(
                job_id = %job_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow job finished"
            ),
            Ok(_) => tracing::debug!(
                job_id = %job_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Job finished"
            ),
            Err(err) => err.log(&job_id),
        }

        self.complete(settle, outcome);
    }

    /// Settle the job, free its slot and immediately refill it
    fn complete(self: &Arc<Self>, settle: Settle<O>, outcome: DispatchResult<O>) {
        let mut state = self.lock();
        match &outcome {
            Ok(_) => state.completed += 1,
            Err(DispatchError::TimedOut(_)) => state.timed_out += 1,
            Err(_) => state.failed += 1,
        }
        state.active -= 1;

        // The caller may have dropped its handle; the outcome is then discarded
        let _ = settle.send(outcome);

        if state.is_idle() {
            state.wake_idle_waiters();
        }
        self.dispatch(&mut state);
    }
}
