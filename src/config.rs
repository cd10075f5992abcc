//! Engine and fetcher configuration.
//!
//! Durations are written as (fractional) seconds when the configuration is
//! loaded from JSON.

use std::{collections::BTreeMap, time::Duration};

use crate::error::TaskError;

/// Default API endpoint of the review aggregator.
pub const DEFAULT_BASE_URL: &str = "https://api.qimai.cn";

/// Terminal tasks older than this are evicted by `cleanup` unless the caller
/// passes its own window.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct FetchOptions {
    /// Minimum spacing between two consecutive requests of the same task.
    #[serde(with = "secs")]
    pub request_delay: Duration,
    /// Attempts spent on one page before giving up on it.
    pub retry_times: u32,
    /// First backoff between attempts, doubled after every failure.
    #[serde(with = "secs")]
    pub retry_delay: Duration,
    #[serde(with = "secs")]
    pub max_retry_delay: Duration,
    /// Deadline for a single request.
    #[serde(with = "secs")]
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            request_delay: Duration::from_secs(2),
            retry_times: 3,
            retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
        }
    }
}

impl FetchOptions {
    /// Backoff to wait after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_delay
            .checked_mul(factor)
            .unwrap_or(self.max_retry_delay)
            .min(self.max_retry_delay)
    }
}

/// Where the review sources live and the opaque values they expect on every
/// request.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct SourceOptions {
    pub base_url: String,
    /// Signed `analysis` query value the aggregator requires.
    pub analysis_key: String,
    pub user_agent: String,
    pub headers: BTreeMap<String, String>,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            analysis_key: String::new(),
            user_agent: concat!("reviewcrawler/", env!("CARGO_PKG_VERSION")).to_string(),
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ceiling on simultaneously running (or paused) tasks.
    pub max_concurrent: usize,
    /// Failed pages in a row that turn into a task error.
    pub max_consecutive_failures: u32,
    #[serde(with = "secs")]
    pub retention: Duration,
    pub fetch: FetchOptions,
    pub source: SourceOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_consecutive_failures: 3,
            retention: DEFAULT_RETENTION,
            fetch: FetchOptions::default(),
            source: SourceOptions::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, TaskError> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|err| TaskError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        if self.max_concurrent == 0 {
            return Err(TaskError::Config(
                "max_concurrent must be greater than 0".into(),
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(TaskError::Config(
                "max_consecutive_failures must be greater than 0".into(),
            ));
        }
        if self.fetch.retry_times == 0 {
            return Err(TaskError::Config(
                "retry_times must be greater than 0".into(),
            ));
        }
        if self.fetch.timeout.is_zero() {
            return Err(TaskError::Config("timeout must be greater than 0".into()));
        }
        if self.source.base_url.is_empty() {
            return Err(TaskError::Config("base_url must not be empty".into()));
        }
        Ok(())
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
