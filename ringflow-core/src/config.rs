//! Coordinator configuration
//!
//! Every timer, interval and retry knob the coordinator uses lives here.
//! Durations are stored as milliseconds so the JSON form stays readable.

use crate::backend::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON for this schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Session timers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// How long an outbound ring may go unanswered
    pub ring_timeout_ms: u64,
    /// How long to wait for the peer to appear in the media channel
    pub peer_presence_timeout_ms: u64,
    /// One-off extension granted when the backend still reports the call live
    pub presence_grace_ms: u64,
    /// Delay between budget exhaustion and the forced end
    pub exhaustion_grace_ms: u64,
    /// How long a disposed session waits for outstanding backend requests
    pub teardown_timeout_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            ring_timeout_ms: 30_000,
            peer_presence_timeout_ms: 5_000,
            presence_grace_ms: 20_000,
            exhaustion_grace_ms: 3_000,
            teardown_timeout_ms: 10_000,
        }
    }
}

/// Status-poll fallback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Interval between status polls
    pub interval_ms: u64,
    /// How long polling continues once the session is accepted or terminal
    pub overlap_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_500,
            overlap_ms: 3_000,
        }
    }
}

/// Billing ticker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Remaining seconds below which the session is flagged low on time
    pub low_time_threshold_secs: u64,
    /// Interval of the connected-time tick
    pub tick_interval_ms: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            low_time_threshold_secs: 120,
            tick_interval_ms: 1_000,
        }
    }
}

/// Candidate matching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// How long each candidate is rung before moving on
    pub attempt_window_ms: u64,
    /// Minimum remaining budget required to start matching
    pub min_budget_seconds: u64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            attempt_window_ms: 10_000,
            min_budget_seconds: 60,
        }
    }
}

/// Media transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Application identifier passed to the transport on initialization
    pub app_id: String,
    /// Join failure code that means "still trying" rather than a hard failure
    pub soft_timeout_code: i32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            app_id: "ringflow".to_string(),
            soft_timeout_code: 10,
        }
    }
}

/// Retries for backend notices and deductions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Linear backoff step between attempts
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 500,
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Maximum live sessions; inbound rings beyond this are answered busy
    pub max_concurrent_calls: usize,
    /// Capacity of the processed-event registry
    pub registry_capacity: usize,
    /// Session timers
    pub timers: TimerConfig,
    /// Poll fallback
    pub poll: PollConfig,
    /// Billing
    pub billing: BillingConfig,
    /// Matching
    pub matching: MatchConfig,
    /// Media transport
    pub media: MediaConfig,
    /// Backend retries
    pub retry: RetryConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 1,
            registry_capacity: 512,
            timers: TimerConfig::default(),
            poll: PollConfig::default(),
            billing: BillingConfig::default(),
            matching: MatchConfig::default(),
            media: MediaConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Parse and validate a JSON config
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or a value is out of range
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or validated
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns the first out-of-range value found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_calls must be at least 1".to_string(),
            ));
        }
        if self.registry_capacity == 0 {
            return Err(ConfigError::Invalid(
                "registry_capacity must be at least 1".to_string(),
            ));
        }
        if !(1_500..=2_000).contains(&self.poll.interval_ms) {
            return Err(ConfigError::Invalid(format!(
                "poll.interval_ms must be between 1500 and 2000, got {}",
                self.poll.interval_ms
            )));
        }
        let timers = [
            ("timers.ring_timeout_ms", self.timers.ring_timeout_ms),
            (
                "timers.peer_presence_timeout_ms",
                self.timers.peer_presence_timeout_ms,
            ),
            ("timers.presence_grace_ms", self.timers.presence_grace_ms),
            ("timers.teardown_timeout_ms", self.timers.teardown_timeout_ms),
            ("billing.tick_interval_ms", self.billing.tick_interval_ms),
            ("matching.attempt_window_ms", self.matching.attempt_window_ms),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Ring timeout
    #[must_use]
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.timers.ring_timeout_ms)
    }

    /// Bound on the backend drain during session teardown
    #[must_use]
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.timers.teardown_timeout_ms)
    }

    /// Poll interval
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll.interval_ms)
    }

    /// Poll overlap after acceptance or termination
    #[must_use]
    pub fn poll_overlap(&self) -> Duration {
        Duration::from_millis(self.poll.overlap_ms)
    }

    /// Billing tick interval
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.billing.tick_interval_ms)
    }

    /// Per-candidate ring window
    #[must_use]
    pub fn attempt_window(&self) -> Duration {
        Duration::from_millis(self.matching.attempt_window_ms)
    }

    /// Retry policy for backend notices
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry.attempts,
            backoff: Duration::from_millis(self.retry.backoff_ms),
        }
    }
}
