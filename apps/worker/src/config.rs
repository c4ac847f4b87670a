//! Worker configuration loaded from environment variables
//!
//! The worker always needs Redis and a job command; everything else has a
//! default suitable for a single download box.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use trackrelay_shared_config::{
    get_env_or_default, get_required_env, parse_env, CommonConfig, Environment, RedisConfig,
    WorkerLoopConfig,
};

/// Worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Common configuration shared with other services
    pub common: CommonConfig,

    /// Durable queue connection; required for a worker
    pub redis: RedisConfig,

    /// Pop, heartbeat and publish timings plus queue names
    pub worker: WorkerLoopConfig,

    /// External command run once per job
    pub command: CommandConfig,

    /// Scratch directory cleanup
    pub scratch: ScratchConfig,
}

/// The program that does the actual work of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandConfig {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchConfig {
    /// Working directory of the job command, swept periodically
    pub dir: PathBuf,

    /// Files older than this are removed, in seconds
    pub max_age_secs: u64,

    /// Interval between sweeps, in seconds
    pub sweep_interval_secs: u64,
}

impl ScratchConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("trackrelay"),
            max_age_secs: 600,
            sweep_interval_secs: 300,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let common = CommonConfig::from_env()
            .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

        let redis = common
            .redis
            .clone()
            .context("REDIS_URL must be set for the worker")?;

        let worker = WorkerLoopConfig::from_env().context("Invalid worker loop configuration")?;
        let command = CommandConfig::from_env()?;

        let defaults = ScratchConfig::default();
        let scratch = ScratchConfig {
            dir: std::env::var("WORKER_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.dir),
            max_age_secs: parse_env("WORKER_SCRATCH_MAX_AGE", defaults.max_age_secs)
                .context("Invalid WORKER_SCRATCH_MAX_AGE value")?,
            sweep_interval_secs: parse_env("WORKER_SWEEP_INTERVAL", defaults.sweep_interval_secs)
                .context("Invalid WORKER_SWEEP_INTERVAL value")?,
        };
        if scratch.sweep_interval_secs == 0 {
            anyhow::bail!("WORKER_SWEEP_INTERVAL must be greater than zero");
        }

        Ok(Self {
            common,
            redis,
            worker,
            command,
            scratch,
        })
    }

    /// Get environment mode
    pub fn environment(&self) -> Environment {
        self.common.environment
    }
}

impl CommandConfig {
    /// `WORKER_COMMAND` is required; `WORKER_COMMAND_ARGS` is split on
    /// whitespace
    pub fn from_env() -> Result<Self> {
        let program = get_required_env("WORKER_COMMAND")
            .map_err(|e| anyhow::anyhow!("{}", e))?
            .trim()
            .to_string();
        if program.is_empty() {
            anyhow::bail!("WORKER_COMMAND must not be empty");
        }

        let args = get_env_or_default("WORKER_COMMAND_ARGS", "")
            .split_whitespace()
            .map(str::to_owned)
            .collect();

        Ok(Self { program, args })
    }
}
