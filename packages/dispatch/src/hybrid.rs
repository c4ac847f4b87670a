//! Local or remote, decided per job
//!
//! Eligible jobs go to the remote worker while its heartbeat is live and run
//! on the local scheduler otherwise. A remote failure the application deems
//! transient runs the job again locally.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::broker::Broker;
use crate::error::{DispatchError, DispatchResult};
use crate::job::Job;
use crate::scheduler::LocalScheduler;

type RoutePredicate<P> = dyn Fn(&Job<P>) -> bool + Send + Sync;
type FallbackPredicate = dyn Fn(&DispatchError) -> bool + Send + Sync;

/// Where a job ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Local,
    Remote,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HybridStats {
    pub local: u64,
    pub remote: u64,
    /// Remote attempts that were re-run locally
    pub fallbacks: u64,
}

pub struct HybridDispatcher<P> {
    scheduler: LocalScheduler<P, Value>,
    broker: Broker<P>,
    remote_timeout: Duration,
    route: Arc<RoutePredicate<P>>,
    fall_back: Arc<FallbackPredicate>,
    counters: Arc<[AtomicU64; 3]>,
}

impl<P> Clone for HybridDispatcher<P> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            broker: self.broker.clone(),
            remote_timeout: self.remote_timeout,
            route: Arc::clone(&self.route),
            fall_back: Arc::clone(&self.fall_back),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<P> std::fmt::Debug for HybridDispatcher<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridDispatcher")
            .field("remote_timeout", &self.remote_timeout)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

const LOCAL: usize = 0;
const REMOTE: usize = 1;
const FALLBACKS: usize = 2;

impl<P> HybridDispatcher<P>
where
    P: Clone + Serialize + Send + Sync + 'static,
{
    /// Every job is eligible for remote execution and only `Unavailable`
    /// triggers a local re-run, until configured otherwise
    pub fn new(scheduler: LocalScheduler<P, Value>, broker: Broker<P>) -> Self {
        let remote_timeout = broker.config().remote_timeout();
        Self {
            scheduler,
            broker,
            remote_timeout,
            route: Arc::new(|_: &Job<P>| true),
            fall_back: Arc::new(|err: &DispatchError| matches!(err, DispatchError::Unavailable(_))),
            counters: Arc::new(Default::default()),
        }
    }

    /// Only jobs matching `route` are considered for remote execution
    pub fn route_when(mut self, route: impl Fn(&Job<P>) -> bool + Send + Sync + 'static) -> Self {
        self.route = Arc::new(route);
        self
    }

    /// Remote errors matching `fall_back` re-run the job locally
    pub fn fall_back_when(
        mut self,
        fall_back: impl Fn(&DispatchError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fall_back = Arc::new(fall_back);
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Pick a route for the job, run it there and wait for the outcome
    pub async fn dispatch(&self, job: Job<P>) -> DispatchResult<(Route, Value)> {
        if (self.route)(&job) && self.broker.has_active_worker().await {
            let job_id = job.id.clone();
            match self.broker.enqueue_and_wait(job.clone(), self.remote_timeout).await {
                Ok(value) => {
                    self.counters[REMOTE].fetch_add(1, Ordering::Relaxed);
                    return Ok((Route::Remote, value));
                }
                Err(err) if (self.fall_back)(&err) => {
                    self.counters[FALLBACKS].fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        job_id = %job_id,
                        error = %err,
                        "Remote execution failed, running job locally"
                    );
                }
                Err(err) => {
                    self.counters[REMOTE].fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
            }
        }

        self.counters[LOCAL].fetch_add(1, Ordering::Relaxed);
        let value = self.scheduler.submit(job)?.await?;
        Ok((Route::Local, value))
    }

    pub fn scheduler(&self) -> &LocalScheduler<P, Value> {
        &self.scheduler
    }

    pub fn broker(&self) -> &Broker<P> {
        &self.broker
    }
}

impl<P> HybridDispatcher<P> {
    pub fn stats(&self) -> HybridStats {
        HybridStats {
            local: self.counters[LOCAL].load(Ordering::Relaxed),
            remote: self.counters[REMOTE].load(Ordering::Relaxed),
            fallbacks: self.counters[FALLBACKS].load(Ordering::Relaxed),
        }
    }
}
