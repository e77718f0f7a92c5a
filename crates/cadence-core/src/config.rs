use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 300; // 5 min without refresh => reclaimable
pub const DEFAULT_LOCK_REFRESH_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 10;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_EXECUTION_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 60;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Upper bound for any interval or retry delay (100 years).
pub const MAX_DELAY_SECS: u64 = 100 * 365 * 24 * 60 * 60;
/// Upper bound for `execution_retention_days` (100 years).
pub const MAX_EXECUTION_RETENTION_DAYS: u32 = 100 * 365;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
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

/// Tuning knobs shared by every worker loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Sleep between polls when nothing is due.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// How long a claim stays valid without a refresh.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_seconds: u64,
    /// Must be strictly shorter than `lock_ttl_seconds`.
    #[serde(default = "default_lock_refresh_interval")]
    pub lock_refresh_interval_seconds: u64,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    #[serde(default = "default_execution_retention_days")]
    pub execution_retention_days: u32,
    /// Fixed worker identity. When unset a `host-pid-random` id is generated
    /// once at process start.
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub default_retry_delay_seconds: u64,
    /// How long a loop may take to wind down before it is aborted.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECS,
            lock_ttl_seconds: DEFAULT_LOCK_TTL_SECS,
            lock_refresh_interval_seconds: DEFAULT_LOCK_REFRESH_INTERVAL_SECS,
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            cleanup_interval_seconds: DEFAULT_CLEANUP_INTERVAL_SECS,
            execution_retention_days: DEFAULT_EXECUTION_RETENTION_DAYS,
            worker_id: None,
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_retry_delay_seconds: DEFAULT_RETRY_DELAY_SECS,
            shutdown_grace_seconds: DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }
}

impl SchedulerConfig {
    /// Reject combinations that would break lock ownership or stall a loop.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_seconds == 0 {
            return Err(invalid("poll_interval_seconds must be greater than zero"));
        }
        if self.lock_ttl_seconds == 0 {
            return Err(invalid("lock_ttl_seconds must be greater than zero"));
        }
        if self.lock_refresh_interval_seconds == 0 {
            return Err(invalid(
                "lock_refresh_interval_seconds must be greater than zero",
            ));
        }
        // A refresh that lands after expiry lets another worker reclaim a live job.
        if self.lock_refresh_interval_seconds >= self.lock_ttl_seconds {
            return Err(CadenceError::Config(format!(
                "lock_refresh_interval_seconds ({}) must be shorter than lock_ttl_seconds ({})",
                self.lock_refresh_interval_seconds, self.lock_ttl_seconds
            )));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(invalid("max_concurrent_jobs must be at least 1"));
        }
        if self.cleanup_interval_seconds == 0 {
            return Err(invalid("cleanup_interval_seconds must be greater than zero"));
        }
        if self.execution_retention_days > MAX_EXECUTION_RETENTION_DAYS {
            return Err(CadenceError::Config(format!(
                "execution_retention_days must be at most {MAX_EXECUTION_RETENTION_DAYS}"
            )));
        }
        if self.default_retry_delay_seconds > MAX_DELAY_SECS {
            return Err(CadenceError::Config(format!(
                "default_retry_delay_seconds must be at most {MAX_DELAY_SECS}"
            )));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> CadenceError {
    CadenceError::Config(msg.to_string())
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_lock_ttl() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}
fn default_lock_refresh_interval() -> u64 {
    DEFAULT_LOCK_REFRESH_INTERVAL_SECS
}
fn default_max_concurrent_jobs() -> usize {
    DEFAULT_MAX_CONCURRENT_JOBS
}
fn default_cleanup_interval() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECS
}
fn default_execution_retention_days() -> u32 {
    DEFAULT_EXECUTION_RETENTION_DAYS
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}
fn default_shutdown_grace() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
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
    ///   2. ~/.cadence/cadence.toml
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CADENCE_SCHEDULER__LOCK_TTL_SECONDS=600`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Self::figment(&path)
            .extract()
            .map_err(|e| CadenceError::Config(e.to_string()))?;

        config.scheduler.validate()?;
        Ok(config)
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CADENCE_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
