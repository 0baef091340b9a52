//! Scheduler configuration.
//!
//! This module provides configuration for the scheduling core: resource
//! capacity, executor concurrency, retry backoff bounds, and per-job
//! defaults. All values are validated at startup.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    // Resource capacity
    /// Total CPU units available to running jobs.
    pub cpu_capacity: u32,
    /// Total memory in MB available to running jobs.
    pub memory_capacity_mb: u32,

    // Executor settings
    /// Maximum number of jobs executing concurrently.
    pub max_concurrent_jobs: usize,

    // Retry settings
    /// Base delay before the first retry.
    pub retry_base_delay: Duration,
    /// Lower clamp for computed retry delays.
    pub retry_min_delay: Duration,
    /// Upper clamp for computed retry delays.
    pub retry_max_delay: Duration,

    // Per-job defaults
    /// Default maximum dispatch attempts.
    pub default_max_attempts: u32,
    /// Default geometric backoff multiplier.
    pub default_backoff_multiplier: f64,
    /// Default per-attempt timeout.
    pub default_timeout: Duration,

    // Admission settings
    /// Sleep after a resource-shortage requeue, to avoid spinning.
    pub admission_backoff: Duration,

    // Lifecycle settings
    /// How long shutdown waits for running jobs before giving up.
    pub shutdown_timeout: Duration,
    /// Buffer size of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cpu_capacity: 8,
            memory_capacity_mb: 4096,
            max_concurrent_jobs: 10,
            retry_base_delay: Duration::from_secs(1),
            retry_min_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(300),
            default_max_attempts: 3,
            default_backoff_multiplier: 2.0,
            default_timeout: Duration::from_secs(3600),
            admission_backoff: Duration::from_millis(25),
            shutdown_timeout: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

impl SchedulerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TASKFORGE_CPU_CAPACITY`: total CPU units (default: 8)
    /// - `TASKFORGE_MEMORY_CAPACITY_MB`: total memory in MB (default: 4096)
    /// - `TASKFORGE_MAX_CONCURRENT_JOBS`: executor pool size (default: 10)
    /// - `TASKFORGE_RETRY_BASE_DELAY_SECS`: retry base delay (default: 1)
    /// - `TASKFORGE_RETRY_MIN_DELAY_SECS`: retry delay lower clamp (default: 1)
    /// - `TASKFORGE_RETRY_MAX_DELAY_SECS`: retry delay upper clamp (default: 300)
    /// - `TASKFORGE_DEFAULT_MAX_ATTEMPTS`: per-job attempt default (default: 3)
    /// - `TASKFORGE_DEFAULT_BACKOFF_MULTIPLIER`: per-job backoff default (default: 2.0)
    /// - `TASKFORGE_DEFAULT_TIMEOUT_SECS`: per-job timeout default (default: 3600)
    /// - `TASKFORGE_ADMISSION_BACKOFF_MS`: requeue backoff sleep (default: 25)
    /// - `TASKFORGE_SHUTDOWN_TIMEOUT_SECS`: shutdown grace period (default: 30)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any variable has an invalid value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TASKFORGE_CPU_CAPACITY") {
            config.cpu_capacity = parse_env_value(&val, "TASKFORGE_CPU_CAPACITY")?;
        }

        if let Ok(val) = std::env::var("TASKFORGE_MEMORY_CAPACITY_MB") {
            config.memory_capacity_mb = parse_env_value(&val, "TASKFORGE_MEMORY_CAPACITY_MB")?;
        }

        if let Ok(val) = std::env::var("TASKFORGE_MAX_CONCURRENT_JOBS") {
            config.max_concurrent_jobs = parse_env_value(&val, "TASKFORGE_MAX_CONCURRENT_JOBS")?;
        }

        if let Ok(val) = std::env::var("TASKFORGE_RETRY_BASE_DELAY_SECS") {
            let secs: u64 = parse_env_value(&val, "TASKFORGE_RETRY_BASE_DELAY_SECS")?;
            config.retry_base_delay = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("TASKFORGE_RETRY_MIN_DELAY_SECS") {
            let secs: u64 = parse_env_value(&val, "TASKFORGE_RETRY_MIN_DELAY_SECS")?;
            config.retry_min_delay = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("TASKFORGE_RETRY_MAX_DELAY_SECS") {
            let secs: u64 = parse_env_value(&val, "TASKFORGE_RETRY_MAX_DELAY_SECS")?;
            config.retry_max_delay = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("TASKFORGE_DEFAULT_MAX_ATTEMPTS") {
            config.default_max_attempts = parse_env_value(&val, "TASKFORGE_DEFAULT_MAX_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("TASKFORGE_DEFAULT_BACKOFF_MULTIPLIER") {
            config.default_backoff_multiplier =
                parse_env_value(&val, "TASKFORGE_DEFAULT_BACKOFF_MULTIPLIER")?;
        }

        if let Ok(val) = std::env::var("TASKFORGE_DEFAULT_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "TASKFORGE_DEFAULT_TIMEOUT_SECS")?;
            config.default_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("TASKFORGE_ADMISSION_BACKOFF_MS") {
            let ms: u64 = parse_env_value(&val, "TASKFORGE_ADMISSION_BACKOFF_MS")?;
            config.admission_backoff = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("TASKFORGE_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "TASKFORGE_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpu_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "cpu_capacity must be greater than 0".to_string(),
            ));
        }

        if self.memory_capacity_mb == 0 {
            return Err(ConfigError::ValidationFailed(
                "memory_capacity_mb must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_jobs must be greater than 0".to_string(),
            ));
        }

        if self.retry_base_delay.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "retry_base_delay must be greater than 0".to_string(),
            ));
        }

        if self.retry_min_delay > self.retry_max_delay {
            return Err(ConfigError::ValidationFailed(
                "retry_min_delay cannot exceed retry_max_delay".to_string(),
            ));
        }

        if self.default_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "default_max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.default_backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationFailed(
                "default_backoff_multiplier must be at least 1.0".to_string(),
            ));
        }

        if self.default_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "default_timeout must be greater than 0".to_string(),
            ));
        }

        if self.admission_backoff.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "admission_backoff must be greater than 0".to_string(),
            ));
        }

        if self.event_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "event_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set resource capacity.
    pub fn with_capacity(mut self, cpu_units: u32, memory_mb: u32) -> Self {
        self.cpu_capacity = cpu_units;
        self.memory_capacity_mb = memory_mb;
        self
    }

    /// Builder method to set executor concurrency.
    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    /// Builder method to set the retry delay bounds.
    pub fn with_retry_delays(mut self, base: Duration, min: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_min_delay = min;
        self.retry_max_delay = max;
        self
    }

    /// Builder method to set the default attempt limit.
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// Builder method to set the default backoff multiplier.
    pub fn with_default_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.default_backoff_multiplier = multiplier;
        self
    }

    /// Builder method to set the default per-attempt timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Builder method to set the admission requeue backoff.
    pub fn with_admission_backoff(mut self, backoff: Duration) -> Self {
        self.admission_backoff = backoff;
        self
    }

    /// Builder method to set the shutdown grace period.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
