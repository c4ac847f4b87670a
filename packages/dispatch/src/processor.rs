//! The injected job processor

use std::future::Future;

use futures_util::future::BoxFuture;
use tokio::task::JoinError;

use crate::job::Job;

/// Executes one job. Supplied by the application to both the local
/// scheduler and the remote worker loop.
///
/// Any `Fn(Job<P>) -> impl Future<Output = anyhow::Result<O>>` closure is
/// a processor.
pub trait JobProcessor<P, O>: Send + Sync + 'static {
    fn process(&self, job: Job<P>) -> BoxFuture<'static, anyhow::Result<O>>;
}

impl<P, O, F, Fut> JobProcessor<P, O> for F
where
    F: Fn(Job<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
{
    fn process(&self, job: Job<P>) -> BoxFuture<'static, anyhow::Result<O>> {
        Box::pin(self(job))
    }
}

/// Render a failed processor task as an execution failure message
pub(crate) fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return "job task was cancelled".to_string();
    }
    let panic = err.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("processor panicked: {}", message)
}
