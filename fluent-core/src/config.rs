//! Client Configuration
//!
//! Settings that used to live in process-wide statics are carried in a
//! [`ClientConfig`] value instead. Whoever constructs a client or an
//! invocation context passes the config along explicitly, so two clients in
//! one process can poll at different rates without stepping on each other.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::TerminationStrategy;

/// Retry timeout used when nothing else is configured, in seconds.
pub const DEFAULT_RETRY_TIMEOUT_SECS: i64 = 30;

/// Sentinel retry timeout meaning "no override, follow the server".
pub const IGNORE_RETRY_TIMEOUT: i64 = -1;

/// Configuration threaded through client construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Delay between long-running operation polls, in seconds.
    ///
    /// A non-negative value overrides any `Retry-After` hint from the
    /// service. [`IGNORE_RETRY_TIMEOUT`] follows the hint instead.
    pub long_running_operation_retry_timeout: i64,

    /// How many times a transient poll failure is retried.
    pub max_poll_retries: u32,

    /// Delay before the first retry of a failed poll, in milliseconds.
    /// Doubles on each further retry.
    pub poll_retry_backoff_ms: u64,

    /// What a task group does with pending tasks once one task failed.
    pub termination_strategy: TerminationStrategy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            long_running_operation_retry_timeout: DEFAULT_RETRY_TIMEOUT_SECS,
            max_poll_retries: 3,
            poll_retry_backoff_ms: 1000,
            termination_strategy: TerminationStrategy::default(),
        }
    }
}

impl ClientConfig {
    /// Parse a configuration from JSON and validate it.
    ///
    /// Missing fields take their default values.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::validation(format!("invalid client configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the long-running operation retry timeout, in seconds.
    pub fn with_long_running_operation_retry_timeout(mut self, seconds: i64) -> Result<Self> {
        self.long_running_operation_retry_timeout = seconds;
        self.validate()?;
        Ok(self)
    }

    /// Set the number of retries for transient poll failures.
    pub fn with_max_poll_retries(mut self, retries: u32) -> Self {
        self.max_poll_retries = retries;
        self
    }

    /// Set the termination strategy used by new invocation contexts.
    pub fn with_termination_strategy(mut self, strategy: TerminationStrategy) -> Self {
        self.termination_strategy = strategy;
        self
    }

    /// Check that every field holds an acceptable value.
    pub fn validate(&self) -> Result<()> {
        let timeout = self.long_running_operation_retry_timeout;
        if timeout < 0 && timeout != IGNORE_RETRY_TIMEOUT {
            return Err(Error::validation(format!(
                "longRunningOperationRetryTimeout must be non-negative or {IGNORE_RETRY_TIMEOUT}, got {timeout}"
            )));
        }
        Ok(())
    }

    /// The fixed poll delay, or `None` when the server hint should be used.
    pub fn retry_timeout_override(&self) -> Option<Duration> {
        u64::try_from(self.long_running_operation_retry_timeout)
            .ok()
            .map(Duration::from_secs)
    }

    /// Delay before retry number `attempt` (zero based) of a failed poll.
    pub fn poll_retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.poll_retry_backoff_ms.saturating_mul(factor))
    }
}
