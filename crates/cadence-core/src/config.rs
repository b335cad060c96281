use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 3;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_TIMEOUT_MINUTES: u32 = 60;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_HOUSEKEEPING_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 60; // 2^n minutes, as the retry ladder expects
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 3600;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_FALLBACK_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_STORE_RETRY_MAX_SECS: u64 = 300;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Which schedule evaluator backs recurring jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorKind {
    /// Full five-field cron evaluation.
    #[default]
    Cron,
    /// Degraded mode: every recurring job fires `fallback_interval_secs` after
    /// the previous evaluation, regardless of its expression.
    FixedInterval,
}

/// Tuning knobs for the dispatch loop and job runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Concurrency ceiling: at most this many jobs run at once.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Seconds between dispatch cycles.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Applied to new jobs that do not set their own timeout.
    #[serde(default = "default_timeout_minutes")]
    pub default_timeout_minutes: u32,
    /// Applied to new jobs that do not set their own retry budget.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Execution records older than this are pruned by housekeeping.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_housekeeping_interval_secs")]
    pub housekeeping_interval_secs: u64,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    /// First retry waits `2 * backoff_base_secs`, doubling per attempt.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// How long shutdown waits for in-flight jobs before cancelling them.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub evaluator: EvaluatorKind,
    #[serde(default = "default_fallback_interval_secs")]
    pub fallback_interval_secs: u64,
    /// Upper bound for the loop's own backoff while the store is unreachable.
    #[serde(default = "default_store_retry_max_secs")]
    pub store_retry_max_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            default_timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            default_max_retries: DEFAULT_MAX_RETRIES,
            retention_days: DEFAULT_RETENTION_DAYS,
            housekeeping_interval_secs: DEFAULT_HOUSEKEEPING_INTERVAL_SECS,
            snapshot_interval_secs: DEFAULT_SNAPSHOT_INTERVAL_SECS,
            backoff_base_secs: DEFAULT_BACKOFF_BASE_SECS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            evaluator: EvaluatorKind::default(),
            fallback_interval_secs: DEFAULT_FALLBACK_INTERVAL_SECS,
            store_retry_max_secs: DEFAULT_STORE_RETRY_MAX_SECS,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn store_retry_max(&self) -> Duration {
        Duration::from_secs(self.store_retry_max_secs)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(CadenceError::Config(
                "scheduler.max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        let intervals = [
            ("poll_interval_secs", self.poll_interval_secs),
            ("housekeeping_interval_secs", self.housekeeping_interval_secs),
            ("snapshot_interval_secs", self.snapshot_interval_secs),
            ("fallback_interval_secs", self.fallback_interval_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(CadenceError::Config(format!(
                "scheduler.{name} must be greater than zero"
            )));
        }
        if self.backoff_base_secs > self.backoff_max_secs {
            return Err(CadenceError::Config(format!(
                "scheduler.backoff_base_secs ({}) exceeds backoff_max_secs ({})",
                self.backoff_base_secs, self.backoff_max_secs
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_max_concurrent_jobs() -> usize {
    DEFAULT_MAX_CONCURRENT_JOBS
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_timeout_minutes() -> u32 {
    DEFAULT_TIMEOUT_MINUTES
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}
fn default_housekeeping_interval_secs() -> u64 {
    DEFAULT_HOUSEKEEPING_INTERVAL_SECS
}
fn default_snapshot_interval_secs() -> u64 {
    DEFAULT_SNAPSHOT_INTERVAL_SECS
}
fn default_backoff_base_secs() -> u64 {
    DEFAULT_BACKOFF_BASE_SECS
}
fn default_backoff_max_secs() -> u64 {
    DEFAULT_BACKOFF_MAX_SECS
}
fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_fallback_interval_secs() -> u64 {
    DEFAULT_FALLBACK_INTERVAL_SECS
}
fn default_store_retry_max_secs() -> u64 {
    DEFAULT_STORE_RETRY_MAX_SECS
}
fn default_log_filter() -> String {
    "cadence=info".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `CADENCE_CONFIG` env var
    ///   3. ~/.cadence/cadence.toml
    ///
    /// Nested keys use a double underscore in the environment, e.g.
    /// `CADENCE_SCHEDULER__MAX_CONCURRENT_JOBS=8`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("CADENCE_CONFIG").ok())
            .unwrap_or_else(default_config_path);
        tracing::debug!(path = %path, "loading config");

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").ignore(&["config"]).split("__"))
            .extract()
            .map_err(|e| CadenceError::Config(e.to_string()))?;

        config.scheduler.validate()?;
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
