//! Completion handles returned to callers

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{DispatchError, DispatchResult};
use crate::job::JobId;

/// Settles exactly once with the job's outcome.
///
/// Dropping the handle does not cancel the job; the outcome is discarded.
#[derive(Debug)]
pub struct JobHandle<T> {
    id: JobId,
    rx: oneshot::Receiver<DispatchResult<T>>,
}

/// Sending half kept by whoever owns the job until it settles
pub(crate) type Settle<T> = oneshot::Sender<DispatchResult<T>>;

impl<T> JobHandle<T> {
    pub(crate) fn channel(id: JobId) -> (Settle<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { id, rx })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Non-blocking check; `None` while the job is still pending
    pub fn try_outcome(&mut self) -> Option<DispatchResult<T>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(dropped())),
        }
    }
}

impl<T> Future for JobHandle<T> {
    type Output = DispatchResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(dropped())))
    }
}

// Only reachable if the owning scheduler or broker is torn down mid-job
fn dropped() -> DispatchError {
    DispatchError::Unavailable("job owner shut down before the job settled".to_string())
}

/// Resolves once a scheduler becomes idle
#[derive(Debug)]
pub struct DrainSignal {
    rx: Option<oneshot::Receiver<()>>,
}

impl DrainSignal {
    pub(crate) fn ready() -> Self {
        Self { rx: None }
    }

    pub(crate) fn waiting(rx: oneshot::Receiver<()>) -> Self {
        Self { rx: Some(rx) }
    }
}

impl Future for DrainSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.rx.as_mut() {
            None => Poll::Ready(()),
            Some(rx) => Pin::new(rx).poll(cx).map(|_| ()),
        }
    }
}
