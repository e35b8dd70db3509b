//! Configuration management for Courier.
//!
//! Settings come from a YAML (or TOML/JSON) file layered under environment
//! variables of the form `COURIER__SECTION__KEY`, e.g.
//! `COURIER__API__TOKEN` or `COURIER__POLLING__MAX_ATTEMPTS`.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::dispatch::RetryPolicy;
use crate::error::{CourierError, Result};
use crate::jobs::PollerConfig;
use crate::ratelimit::AdmissionRules;

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CourierConfig {
    /// Remote API endpoint and credentials
    #[serde(default)]
    pub api: ApiConfig,

    /// Concurrency and rate quotas
    #[serde(default)]
    pub admission: AdmissionRules,

    /// Backoff for retryable failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Job poll cadence
    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Base URL every request path is joined onto
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Header the token is sent in
    #[serde(default = "default_auth_header")]
    pub auth_header: String,

    /// API token
    #[serde(default)]
    pub token: Option<SecretString>,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth_header: default_auth_header(),
            token: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_base_url() -> String {
    "https://yul1.qualtrics.com/API/v3/".to_string()
}

fn default_auth_header() -> String {
    "X-API-TOKEN".to_string()
}

fn default_timeout_secs() -> u64 {
    100
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per call, the first included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Fraction of each delay randomized, 0 to 1
    #[serde(default)]
    pub jitter: f64,

    /// Wait out remote retry-after hints when longer than the backoff
    #[serde(default)]
    pub honor_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: 0.0,
            honor_retry_after: false,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .jitter(self.jitter)
            .honor_retry_after(self.honor_retry_after)
    }
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

/// Polling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Status checks before a job times out
    #[serde(default = "default_poll_attempts")]
    pub max_attempts: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_attempts: default_poll_attempts(),
        }
    }
}

impl PollingConfig {
    pub fn to_poller_config(&self) -> PollerConfig {
        PollerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_poll_attempts: self.max_attempts,
            ..PollerConfig::default()
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_poll_attempts() -> u32 {
    60
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl CourierConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("COURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| CourierError::Config(e.to_string()))?;

        Self::from_settings(settings)
    }

    /// Parse configuration from a YAML string, ignoring the environment.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .map_err(|e| CourierError::Config(e.to_string()))?;

        Self::from_settings(settings)
    }

    fn from_settings(settings: config::Config) -> Result<Self> {
        let config: CourierConfig = settings
            .try_deserialize()
            .map_err(|e| CourierError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the dispatcher or poller cannot run with.
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.api.base_url)
            .map_err(|e| CourierError::Config(format!("invalid api.base_url: {}", e)))?;
        if self.api.timeout_secs == 0 {
            return Err(CourierError::Config("api.timeout_secs must be positive".into()));
        }
        self.admission.validate()?;
        if self.retry.max_attempts == 0 {
            return Err(CourierError::Config("retry.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(CourierError::Config("retry.jitter must be between 0 and 1".into()));
        }
        if self.polling.poll_interval_secs == 0 || self.polling.max_attempts == 0 {
            return Err(CourierError::Config(
                "polling.poll_interval_secs and polling.max_attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}
