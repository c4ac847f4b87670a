//! Job dispatch configuration: queue names, local scheduler limits,
//! broker liveness and reconnect policy, remote worker loop timings

use std::time::Duration;

use crate::{get_env_or_default, parse_env, ConfigError, ConfigResult};

/// Names of the durable queue, result channel and heartbeat key.
///
/// The broker and every worker must agree on these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    /// List that jobs are pushed onto and popped from
    pub queue: String,

    /// Pub/sub channel carrying results back to the broker
    pub results: String,

    /// Key holding the last worker heartbeat (epoch millis)
    pub heartbeat: String,
}

impl QueueKeys {
    pub fn from_env() -> Self {
        Self {
            queue: get_env_or_default("DISPATCH_QUEUE_KEY", "music:download:queue"),
            results: get_env_or_default("DISPATCH_RESULTS_CHANNEL", "music:download:results"),
            heartbeat: get_env_or_default("DISPATCH_HEARTBEAT_KEY", "music:worker:heartbeat"),
        }
    }

    /// Keys sharing a common prefix, e.g. `prefix:queue`
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            queue: format!("{}:queue", prefix),
            results: format!("{}:results", prefix),
            heartbeat: format!("{}:heartbeat", prefix),
        }
    }
}

impl Default for QueueKeys {
    fn default() -> Self {
        Self {
            queue: "music:download:queue".to_string(),
            results: "music:download:results".to_string(),
            heartbeat: "music:worker:heartbeat".to_string(),
        }
    }
}

/// In-process scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum simultaneously executing jobs (at least 1)
    pub max_concurrent: usize,

    /// Per-job execution timeout in seconds
    pub job_timeout_secs: u64,

    /// Queue wait above which a warning is logged, in seconds
    pub slow_wait_secs: u64,

    /// Execution time above which the duration is logged, in seconds
    pub slow_run_secs: u64,

    /// Start paused (jobs queue up until `resume`)
    pub start_paused: bool,
}

impl SchedulerConfig {
    pub fn from_env() -> ConfigResult<Self> {
        let config = Self {
            max_concurrent: parse_env("SCHEDULER_MAX_CONCURRENT", 1)?,
            job_timeout_secs: parse_env("SCHEDULER_JOB_TIMEOUT", 600)?,
            slow_wait_secs: parse_env("SCHEDULER_SLOW_WAIT", 60)?,
            slow_run_secs: parse_env("SCHEDULER_SLOW_RUN", 30)?,
            start_paused: parse_env("SCHEDULER_START_PAUSED", false)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.job_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "SCHEDULER_JOB_TIMEOUT".to_string(),
                "timeout must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    /// Builder-style override of the concurrency limit
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn slow_wait(&self) -> Duration {
        Duration::from_secs(self.slow_wait_secs)
    }

    pub fn slow_run(&self) -> Duration {
        Duration::from_secs(self.slow_run_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            job_timeout_secs: 600,
            slow_wait_secs: 60,
            slow_run_secs: 30,
            start_paused: false,
        }
    }
}

/// Retry schedule used while opening the link to the durable queue.
///
/// Attempt `n` (1-based) waits `min(n * base_delay_ms, max_delay_ms)`
/// before the next try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl ReconnectPolicy {
    pub fn from_env() -> ConfigResult<Self> {
        Ok(Self {
            max_attempts: parse_env("BROKER_RECONNECT_ATTEMPTS", 10)?,
            base_delay_ms: parse_env("BROKER_RECONNECT_BASE_DELAY_MS", 100)?,
            max_delay_ms: parse_env("BROKER_RECONNECT_MAX_DELAY_MS", 3000)?,
        })
    }

    /// A policy that tries exactly once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = (attempt as u64).saturating_mul(self.base_delay_ms);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 3000,
        }
    }
}

/// Broker (job producer side) configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub keys: QueueKeys,

    /// A worker is alive if its heartbeat is younger than this, in seconds
    pub liveness_window_secs: u64,

    /// Default wait for a remote result, in seconds
    pub remote_timeout_secs: u64,

    /// How long ids of timed-out or detached jobs are remembered, in seconds
    pub retention_secs: u64,

    pub reconnect: ReconnectPolicy,
}

impl BrokerConfig {
    pub fn from_env() -> ConfigResult<Self> {
        let config = Self {
            keys: QueueKeys::from_env(),
            liveness_window_secs: parse_env("BROKER_LIVENESS_WINDOW", 60)?,
            remote_timeout_secs: parse_env("BROKER_REMOTE_TIMEOUT", 600)?,
            retention_secs: parse_env("BROKER_RETENTION", 3600)?,
            reconnect: ReconnectPolicy::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.liveness_window_secs == 0 {
            return Err(ConfigError::ValidationError(
                "BROKER_LIVENESS_WINDOW must be greater than zero".to_string(),
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "BROKER_RECONNECT_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_keys(mut self, keys: QueueKeys) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            keys: QueueKeys::default(),
            liveness_window_secs: 60,
            remote_timeout_secs: 600,
            retention_secs: 3600,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Remote worker loop configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLoopConfig {
    pub keys: QueueKeys,

    /// Bounded wait of one blocking pop, in seconds
    pub pop_timeout_secs: u64,

    /// Interval between heartbeats, in seconds
    pub heartbeat_interval_secs: u64,

    /// Server-side expiry of the heartbeat key, in seconds
    pub heartbeat_ttl_secs: u64,

    /// Per-job execution limit in seconds, 0 disables it
    pub job_timeout_secs: u64,

    /// Pause after a queue error before popping again, in seconds
    pub error_backoff_secs: u64,

    /// Attempts made to publish one result
    pub publish_attempts: u32,
}

impl WorkerLoopConfig {
    pub fn from_env() -> ConfigResult<Self> {
        let config = Self {
            keys: QueueKeys::from_env(),
            pop_timeout_secs: parse_env("WORKER_POP_TIMEOUT", 30)?,
            heartbeat_interval_secs: parse_env("WORKER_HEARTBEAT_INTERVAL", 30)?,
            heartbeat_ttl_secs: parse_env("WORKER_HEARTBEAT_TTL", 120)?,
            job_timeout_secs: parse_env("WORKER_JOB_TIMEOUT", 180)?,
            error_backoff_secs: parse_env("WORKER_ERROR_BACKOFF", 5)?,
            publish_attempts: parse_env("WORKER_PUBLISH_ATTEMPTS", 3)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "WORKER_HEARTBEAT_INTERVAL must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_ttl_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::ValidationError(format!(
                "WORKER_HEARTBEAT_TTL ({}s) must exceed WORKER_HEARTBEAT_INTERVAL ({}s)",
                self.heartbeat_ttl_secs, self.heartbeat_interval_secs
            )));
        }
        if self.pop_timeout_secs == 0 {
            // BRPOP treats 0 as "block forever", which would starve the loop
            return Err(ConfigError::InvalidValue(
                "WORKER_POP_TIMEOUT".to_string(),
                "must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_keys(mut self, keys: QueueKeys) -> Self {
        self.keys = keys;
        self
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_secs(self.pop_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        (self.job_timeout_secs > 0).then(|| Duration::from_secs(self.job_timeout_secs))
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

impl Default for WorkerLoopConfig {
    fn default() -> Self {
        Self {
            keys: QueueKeys::default(),
            pop_timeout_secs: 30,
            heartbeat_interval_secs: 30,
            heartbeat_ttl_secs: 120,
            job_timeout_secs: 180,
            error_backoff_secs: 5,
            publish_attempts: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_key_defaults() {
        let keys = QueueKeys::default();
        assert_eq!(keys.queue, "music:download:queue");
        assert_eq!(keys.results, "music:download:results");
        assert_eq!(keys.heartbeat, "music:worker:heartbeat");
    }

    #[test]
    fn test_queue_keys_with_prefix() {
        let keys = QueueKeys::with_prefix("test:42");
        assert_eq!(keys.queue, "test:42:queue");
        assert_eq!(keys.results, "test:42:results");
        assert_eq!(keys.heartbeat, "test:42:heartbeat");
    }

    #[test]
    fn test_reconnect_delay_is_linear_then_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(5), Duration::from_millis(500));
        assert_eq!(policy.delay_for(30), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(3000));
    }

    #[test]
    fn test_scheduler_from_env() {
        temp_env::with_vars(
            [
                ("SCHEDULER_MAX_CONCURRENT", Some("4")),
                ("SCHEDULER_JOB_TIMEOUT", Some("120")),
                ("SCHEDULER_SLOW_WAIT", None),
                ("SCHEDULER_SLOW_RUN", None),
                ("SCHEDULER_START_PAUSED", None),
            ],
            || {
                let config = SchedulerConfig::from_env().unwrap();
                assert_eq!(config.max_concurrent, 4);
                assert_eq!(config.job_timeout(), Duration::from_secs(120));
                assert_eq!(config.slow_wait(), Duration::from_secs(60));
                assert!(!config.start_paused);
            },
        );
    }

    #[test]
    fn test_scheduler_rejects_garbage() {
        temp_env::with_var("SCHEDULER_MAX_CONCURRENT", Some("many"), || {
            assert!(matches!(
                SchedulerConfig::from_env(),
                Err(ConfigError::InvalidValue(name, _)) if name == "SCHEDULER_MAX_CONCURRENT"
            ));
        });
    }

    #[test]
    fn test_broker_validation() {
        let mut config = BrokerConfig::default();
        assert!(config.validate().is_ok());
        config.liveness_window_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_heartbeat_ttl_must_exceed_interval() {
        let config = WorkerLoopConfig {
            heartbeat_ttl_secs: 30,
            ..WorkerLoopConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_worker_job_timeout_zero_disables() {
        let config = WorkerLoopConfig {
            job_timeout_secs: 0,
            ..WorkerLoopConfig::default()
        };
        assert_eq!(config.job_timeout(), None);
        assert_eq!(
            WorkerLoopConfig::default().job_timeout(),
            Some(Duration::from_secs(180))
        );
    }
}
