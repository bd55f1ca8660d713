//! Run configuration: throttle delays and the retry policy.
//!
//! Everything has a default, so a config file only needs the values it changes:
//! ```json
//! { "page_delay": 1000, "request_timeout": 10000, "retry": { "max_retries": 3 } }
//! ```
//! Durations are in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    Result, BACKOFF_BASE_DELAY_MS, FAILURE_DELAY_MS, MAX_RETRIES, PAGE_DELAY_MS,
    REQUEST_TIMEOUT_MS, RETRY_DELAY_MS,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    /// Wait after every successfully scraped page.
    #[serde(with = "millis")]
    pub page_delay: Duration,
    /// Wait after a page that failed all of its attempts.
    #[serde(with = "millis")]
    pub failure_delay: Duration,
    /// Wait after a page recovered in the retry sweep.
    #[serde(with = "millis")]
    pub retry_delay: Duration,
    /// Upper bound for a single HTTP request, so a stalled connection uses up an attempt.
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            page_delay: Duration::from_millis(PAGE_DELAY_MS),
            failure_delay: Duration::from_millis(FAILURE_DELAY_MS),
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT_MS),
            retry: RetryPolicy::default(),
        }
    }
}

impl ScrapeConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// How a single page is retried before it counts as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts on top of the first one.
    pub max_retries: u32,
    /// Wait before the first retry, doubled for every retry after it.
    #[serde(with = "millis")]
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay: Duration::from_millis(BACKOFF_BASE_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `attempt + 1`: `base_delay * 2^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
