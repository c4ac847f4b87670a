//! Job and result value types
//!
//! A [`Job`] is immutable once created. Its JSON form is what travels over
//! the durable queue; a [`TaskResult`] is what comes back on the result
//! channel.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Correlation key between a submitted job and its result
pub type JobId = String;

/// Length of the random id suffix
const ID_SUFFIX_LEN: usize = 12;

/// Generate a new job id: `task_<epoch millis>_<random suffix>`
pub fn generate_job_id() -> JobId {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_SUFFIX_LEN)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("task_{}_{}", Utc::now().timestamp_millis(), suffix)
}

/// One unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job<P> {
    pub id: JobId,

    /// Application payload; never inspected by the dispatch layer
    pub payload: P,

    /// Higher runs earlier; equal priorities keep arrival order
    #[serde(default)]
    pub priority: i64,

    /// When the job was created
    #[serde(rename = "createdAt", with = "chrono::serde::ts_milliseconds")]
    pub enqueued_at: DateTime<Utc>,

    /// Owner tag used by selective cancellation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

impl<P> Job<P> {
    pub fn new(payload: P) -> Self {
        Self {
            id: generate_job_id(),
            payload,
            priority: 0,
            enqueued_at: Utc::now(),
            user_id: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_user_id(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Replace the id, e.g. after a collision
    pub(crate) fn regenerate_id(&mut self) {
        self.id = generate_job_id();
    }

    /// Time since creation; zero if the clock went backwards
    pub fn age(&self) -> Duration {
        (Utc::now() - self.enqueued_at).to_std().unwrap_or_default()
    }
}

/// Outcome of one remotely executed job, as published by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    #[serde(alias = "taskId")]
    pub id: JobId,

    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none", alias = "error")]
    pub error_message: Option<String>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(id: impl Into<JobId>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error_message: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(id: impl Into<JobId>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error_message: Some(message.into()),
            completed_at: Utc::now(),
        }
    }
}

/// Pre-queue admission check supplied by the embedding application
pub trait JobValidator<P>: Send + Sync {
    /// Return a human-readable reason to reject the payload
    fn validate(&self, payload: &P) -> Result<(), String>;
}

impl<P, F> JobValidator<P> for F
where
    F: Fn(&P) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, payload: &P) -> Result<(), String> {
        self(payload)
    }
}

/// Validator that admits every payload
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl<P> JobValidator<P> for AcceptAll {
    fn validate(&self, _payload: &P) -> Result<(), String> {
        Ok(())
    }
}
