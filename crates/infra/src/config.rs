//! Configuration for the resilience layer, loaded from `cvewatch.toml`.
//!
//! Every section is optional; missing values use the defaults below. The
//! `CVEWATCH_CONFIG` environment variable points [`ResilienceConfig::from_env`]
//! at a different file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::retry::RetryConfig;
use crate::scheduler::SchedulerConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "CVEWATCH_CONFIG";

/// File loaded when `CVEWATCH_CONFIG` is unset.
pub const DEFAULT_CONFIG_FILE: &str = "cvewatch.toml";

/// Configuration loading/validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Token-bucket size per external API, keyed by API name.
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
    pub retry: RetrySettings,
    pub locks: LockSettings,
    pub scheduler: SchedulerSettings,
}

/// Per-API rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
}

impl RateLimitConfig {
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
        }
    }
}

/// Default retry behaviour for job bodies.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_backoff_secs: f64,
    pub max_backoff_secs: f64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_secs: 5.0,
            max_backoff_secs: 300.0,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: secs_to_duration(self.initial_backoff_secs),
            max_backoff: secs_to_duration(self.max_backoff_secs),
            multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }
}

/// Out-of-range values saturate; `validate` rejects them up front.
fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Job lock timing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Age after which a held lock is presumed abandoned and may be taken over.
    pub default_timeout_secs: u64,
    /// Age after which the leak check warns about a held lock.
    pub leak_threshold_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: 600,
            leak_threshold_secs: 3600,
        }
    }
}

/// Dispatch loop timing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_ms: u64,
    pub shutdown_grace_secs: u64,
    pub leak_check_interval_secs: u64,
    /// Offset from UTC, in minutes, for daily trigger hours (e.g. 120 for UTC+2).
    pub calendar_utc_offset_minutes: i32,
}

impl SchedulerSettings {
    fn calendar_offset(&self) -> Option<FixedOffset> {
        self.calendar_utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            shutdown_grace_secs: 30,
            leak_check_interval_secs: 60,
            calendar_utc_offset_minutes: 0,
        }
    }
}

fn default_rate_limits() -> BTreeMap<String, RateLimitConfig> {
    [
        ("nvd_api", 5),
        ("github_api", 30),
        ("duckduckgo", 20),
        ("ollama", 60),
    ]
    .into_iter()
    .map(|(name, rpm)| (name.to_string(), RateLimitConfig::per_minute(rpm)))
    .collect()
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            rate_limits: default_rate_limits(),
            retry: RetrySettings::default(),
            locks: LockSettings::default(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

impl ResilienceConfig {
    /// Load from the file named by `CVEWATCH_CONFIG`, or `cvewatch.toml`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load(path)
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "config file not found; using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&contents)?;
        info!(
            path = %path.display(),
            apis = config.rate_limits.len(),
            "loaded resilience config"
        );
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ResilienceConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (api, limit) in &self.rate_limits {
            if limit.requests_per_minute == 0 {
                return Err(ConfigError::Invalid(format!(
                    "rate_limits.{api}.requests_per_minute must be > 0"
                )));
            }
        }

        let retry = &self.retry;
        if retry.max_retries == 0 {
            return Err(ConfigError::Invalid("retry.max_retries must be >= 1".into()));
        }
        if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        let representable = |v: f64| Duration::try_from_secs_f64(v).is_ok();
        if !representable(retry.initial_backoff_secs) || !representable(retry.max_backoff_secs) {
            return Err(ConfigError::Invalid(
                "retry backoff durations must be non-negative and fit in a Duration".into(),
            ));
        }
        if retry.initial_backoff_secs > retry.max_backoff_secs {
            return Err(ConfigError::Invalid(
                "retry.initial_backoff_secs must not exceed retry.max_backoff_secs".into(),
            ));
        }

        if self.locks.default_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "locks.default_timeout_secs must be > 0".into(),
            ));
        }
        if self.scheduler.tick_ms == 0 {
            return Err(ConfigError::Invalid("scheduler.tick_ms must be > 0".into()));
        }
        if self.scheduler.calendar_offset().is_none() {
            return Err(ConfigError::Invalid(
                "scheduler.calendar_utc_offset_minutes must be within +/- 24h".into(),
            ));
        }

        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.retry.to_retry_config()
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick: Duration::from_millis(self.scheduler.tick_ms),
            shutdown_grace: Duration::from_secs(self.scheduler.shutdown_grace_secs),
            default_lock_timeout: Duration::from_secs(self.locks.default_timeout_secs),
            leak_threshold: Duration::from_secs(self.locks.leak_threshold_secs),
            leak_check_interval: Duration::from_secs(self.scheduler.leak_check_interval_secs),
            calendar_offset: self.scheduler.calendar_offset().unwrap_or(Utc.fix()),
        }
    }
}
