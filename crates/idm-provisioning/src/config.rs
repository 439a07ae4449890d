//! Provisioning configuration parsed from environment variables.
//!
//! Every variable is optional; unset variables fall back to the [`Default`]
//! values.
//!
//! - `IDM_PROVISIONING_MAX_ATTEMPTS`: attempts before an operation is left for manual resolution (6)
//! - `IDM_PROVISIONING_RETRY_INITIAL_DELAY_SECS` (120), `IDM_PROVISIONING_RETRY_MAX_DELAY_SECS` (21600)
//! - `IDM_PROVISIONING_RETRY_MULTIPLIER` (2.0), `IDM_PROVISIONING_RETRY_JITTER` (false)
//! - `IDM_PROVISIONING_SEND_PASSWORD_ATTRIBUTES_TOGETHER` (true)
//! - `IDM_PROVISIONING_BREAK_GLOBAL_<TYPE>_PERIOD_MINUTES`, `..._WARNING_LIMIT`,
//!   `..._DISABLE_LIMIT`, `..._DISABLED` for `<TYPE>` in `CREATE`, `UPDATE`, `DELETE`
//! - `IDM_PROVISIONING_WORKER_POLL_INTERVAL_MS` (1000), `IDM_PROVISIONING_WORKER_CONCURRENCY` (4)

use std::env;
use std::str::FromStr;
use std::time::Duration;

use idm_connector::OperationType;
use thiserror::Error;

const PREFIX: &str = "IDM_PROVISIONING";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed.
    #[error("Invalid value '{value}' for {var}")]
    InvalidValue { var: String, value: String },
}

/// Retry timing of failed operations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts before an operation stops being rescheduled.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound of the delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_secs(120),
            max_delay: Duration::from_secs(6 * 3600),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

/// Limits of the environment-level break configuration for one operation type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakLimits {
    /// Counting window.
    pub period_minutes: u32,
    /// Count at which a warning is raised.
    pub warning_limit: Option<u32>,
    /// Count at which dispatch is blocked.
    pub disable_limit: Option<u32>,
    /// Whether the breaker is switched off.
    pub disabled: bool,
}

impl Default for BreakLimits {
    fn default() -> Self {
        Self {
            period_minutes: 20,
            warning_limit: None,
            disable_limit: None,
            disabled: false,
        }
    }
}

/// Environment-level break configuration used when a system has none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalBreakConfig {
    pub create: BreakLimits,
    pub update: BreakLimits,
    pub delete: BreakLimits,
}

impl GlobalBreakConfig {
    /// Limits for an operation type.
    #[must_use]
    pub fn for_operation(&self, operation_type: OperationType) -> &BreakLimits {
        match operation_type {
            OperationType::Create => &self.create,
            OperationType::Update => &self.update,
            OperationType::Delete => &self.delete,
        }
    }
}

/// Retry worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Number of batches processed concurrently.
    pub concurrency: usize,
    /// How often due batches are polled.
    pub poll_interval_ms: u64,
    /// Maximum batches fetched per poll.
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 1000,
            batch_size: 20,
        }
    }
}

/// Provisioning engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisioningConfig {
    pub retry: RetryConfig,
    /// Send the password and the attributes sent on password change in one operation.
    pub send_password_attributes_together: bool,
    pub global_break: GlobalBreakConfig,
    pub worker: WorkerConfig,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            send_password_attributes_together: true,
            global_break: GlobalBreakConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl ProvisioningConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let retry = RetryConfig {
            max_attempts: var("MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            initial_delay: Duration::from_secs(var(
                "RETRY_INITIAL_DELAY_SECS",
                defaults.retry.initial_delay.as_secs(),
            )?),
            max_delay: Duration::from_secs(var(
                "RETRY_MAX_DELAY_SECS",
                defaults.retry.max_delay.as_secs(),
            )?),
            backoff_multiplier: var("RETRY_MULTIPLIER", defaults.retry.backoff_multiplier)?,
            jitter: var("RETRY_JITTER", defaults.retry.jitter)?,
        };

        let global_break = GlobalBreakConfig {
            create: break_limits(OperationType::Create)?,
            update: break_limits(OperationType::Update)?,
            delete: break_limits(OperationType::Delete)?,
        };

        let worker = WorkerConfig {
            concurrency: var("WORKER_CONCURRENCY", defaults.worker.concurrency)?,
            poll_interval_ms: var("WORKER_POLL_INTERVAL_MS", defaults.worker.poll_interval_ms)?,
            batch_size: var("WORKER_BATCH_SIZE", defaults.worker.batch_size)?,
        };

        Ok(Self {
            retry,
            send_password_attributes_together: var(
                "SEND_PASSWORD_ATTRIBUTES_TOGETHER",
                defaults.send_password_attributes_together,
            )?,
            global_break,
            worker,
        })
    }
}

fn break_limits(operation_type: OperationType) -> Result<BreakLimits, ConfigError> {
    let defaults = BreakLimits::default();
    let scope = format!("BREAK_GLOBAL_{}", operation_type.as_str());
    Ok(BreakLimits {
        period_minutes: var(&format!("{scope}_PERIOD_MINUTES"), defaults.period_minutes)?,
        warning_limit: optional_var(&format!("{scope}_WARNING_LIMIT"))?,
        disable_limit: optional_var(&format!("{scope}_DISABLE_LIMIT"))?,
        disabled: var(&format!("{scope}_DISABLED"), defaults.disabled)?,
    })
}

fn var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    Ok(optional_var(name)?.unwrap_or(default))
}

fn optional_var<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    let var = format!("{PREFIX}_{name}");
    match env::var(&var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        _ => Ok(None),
    }
}
