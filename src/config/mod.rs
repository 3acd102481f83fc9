//! Configuration management for ranksync
//!
//! This module handles loading and validating configuration from environment variables
//! and TOML files. Validation runs before any work begins so that a bad setting
//! never costs API budget.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ratelimit::retry::RetryPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Upstream API configuration
    pub api: ApiConfig,

    /// Work execution configuration
    pub sync: SyncConfig,

    /// Activity retry policy
    pub retry: RetryConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Upstream API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the leaderboard API
    pub base_url: String,

    /// Bearer token (optional)
    pub api_token: Option<String>,

    /// Client-side pacing (requests per second)
    pub requests_per_second: u32,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Records requested per page
    pub page_size: usize,

    /// Per-request retries for transient transport failures
    pub max_request_retries: u32,
}

/// Work execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Concurrency ceiling for work units
    pub max_concurrency: usize,

    /// Page cap per work unit
    pub pages_per_unit: u32,

    /// Pause between phases
    pub phase_cooldown_secs: u64,

    /// Bound on continue-as-new iterations for one run
    pub max_continuations: u32,

    /// Points kept in reserve before refusing to spend more
    pub min_points_reserve: f64,

    /// Short fixed delay that lets points regenerate
    pub regen_delay_secs: u64,
}

/// Activity retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub maximum_interval_ms: u64,
    pub maximum_attempts: u32,
    pub activity_timeout_secs: u64,
    pub heartbeat_timeout_secs: u64,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path for records and workflow state
    pub sqlite_path: PathBuf,

    /// Directory for JSON checkpoints; SQLite is used when unset
    pub checkpoint_dir: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let base_url = std::env::var("RANKSYNC_API_URL").unwrap_or(defaults.api.base_url);
        let api_token = std::env::var("RANKSYNC_API_TOKEN").ok();

        let sqlite_path = std::env::var("RANKSYNC_SQLITE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage.sqlite_path);
        let checkpoint_dir = std::env::var("RANKSYNC_CHECKPOINT_DIR")
            .ok()
            .map(PathBuf::from);

        let level = std::env::var("RANKSYNC_LOG_LEVEL").unwrap_or(defaults.logging.level);
        let format = std::env::var("RANKSYNC_LOG_FORMAT").unwrap_or(defaults.logging.format);

        Ok(Self {
            api: ApiConfig {
                base_url,
                api_token,
                requests_per_second: env_or(
                    "RANKSYNC_REQUESTS_PER_SECOND",
                    defaults.api.requests_per_second,
                ),
                request_timeout_secs: env_or(
                    "RANKSYNC_REQUEST_TIMEOUT",
                    defaults.api.request_timeout_secs,
                ),
                page_size: env_or("RANKSYNC_PAGE_SIZE", defaults.api.page_size),
                max_request_retries: env_or(
                    "RANKSYNC_MAX_REQUEST_RETRIES",
                    defaults.api.max_request_retries,
                ),
            },
            sync: SyncConfig {
                max_concurrency: env_or("RANKSYNC_MAX_CONCURRENCY", defaults.sync.max_concurrency),
                pages_per_unit: env_or("RANKSYNC_PAGES_PER_UNIT", defaults.sync.pages_per_unit),
                phase_cooldown_secs: env_or(
                    "RANKSYNC_PHASE_COOLDOWN",
                    defaults.sync.phase_cooldown_secs,
                ),
                max_continuations: env_or(
                    "RANKSYNC_MAX_CONTINUATIONS",
                    defaults.sync.max_continuations,
                ),
                min_points_reserve: env_or(
                    "RANKSYNC_MIN_POINTS_RESERVE",
                    defaults.sync.min_points_reserve,
                ),
                regen_delay_secs: env_or("RANKSYNC_REGEN_DELAY", defaults.sync.regen_delay_secs),
            },
            retry: RetryConfig {
                initial_interval_ms: env_or(
                    "RANKSYNC_RETRY_INITIAL_MS",
                    defaults.retry.initial_interval_ms,
                ),
                backoff_coefficient: env_or(
                    "RANKSYNC_RETRY_BACKOFF",
                    defaults.retry.backoff_coefficient,
                ),
                maximum_interval_ms: env_or(
                    "RANKSYNC_RETRY_MAX_MS",
                    defaults.retry.maximum_interval_ms,
                ),
                maximum_attempts: env_or(
                    "RANKSYNC_RETRY_ATTEMPTS",
                    defaults.retry.maximum_attempts,
                ),
                activity_timeout_secs: env_or(
                    "RANKSYNC_ACTIVITY_TIMEOUT",
                    defaults.retry.activity_timeout_secs,
                ),
                heartbeat_timeout_secs: env_or(
                    "RANKSYNC_HEARTBEAT_TIMEOUT",
                    defaults.retry.heartbeat_timeout_secs,
                ),
            },
            storage: StorageConfig {
                sqlite_path,
                checkpoint_dir,
            },
            logging: LoggingConfig { level, format },
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.api.base_url)
            .with_context(|| format!("Invalid api.base_url: {}", self.api.base_url))?;

        if self.api.requests_per_second == 0 {
            anyhow::bail!("requests_per_second must be greater than 0");
        }

        if self.api.page_size == 0 {
            anyhow::bail!("page_size must be greater than 0");
        }

        if self.sync.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be greater than 0");
        }

        if self.sync.pages_per_unit == 0 {
            anyhow::bail!("pages_per_unit must be greater than 0");
        }

        if self.sync.min_points_reserve < 0.0 {
            anyhow::bail!("min_points_reserve must not be negative");
        }

        if self.retry.maximum_attempts == 0 {
            anyhow::bail!("maximum_attempts must be greater than 0");
        }

        if self.retry.backoff_coefficient < 1.0 {
            anyhow::bail!("backoff_coefficient must be at least 1.0");
        }

        if self.retry.heartbeat_timeout_secs == 0 || self.retry.activity_timeout_secs == 0 {
            anyhow::bail!("activity and heartbeat timeouts must be positive");
        }

        Ok(())
    }

    /// Get request timeout as Duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }

    /// Activity retry policy derived from the retry section
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(self.retry.initial_interval_ms),
            backoff_coefficient: self.retry.backoff_coefficient,
            maximum_interval: Duration::from_millis(self.retry.maximum_interval_ms),
            maximum_attempts: self.retry.maximum_attempts,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                base_url: String::from("http://localhost:8080/api"),
                api_token: None,
                requests_per_second: 5,
                request_timeout_secs: 30,
                page_size: 100,
                max_request_retries: 3,
            },
            sync: SyncConfig {
                max_concurrency: 4,
                pages_per_unit: 5,
                phase_cooldown_secs: 2,
                max_continuations: 48,
                min_points_reserve: 1.0,
                regen_delay_secs: 5,
            },
            retry: RetryConfig {
                initial_interval_ms: 1000,
                backoff_coefficient: 2.0,
                maximum_interval_ms: 60_000,
                maximum_attempts: 3,
                activity_timeout_secs: 3600,
                heartbeat_timeout_secs: 300,
            },
            storage: StorageConfig {
                sqlite_path: PathBuf::from("data/ranksync.db"),
                checkpoint_dir: None,
            },
            logging: LoggingConfig {
                level: String::from("info"),
                format: String::from("text"),
            },
        }
    }
}
