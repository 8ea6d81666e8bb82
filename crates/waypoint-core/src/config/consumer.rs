use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::exponential_delay;
use crate::error::{Result, WaypointError};

/// What to do when a handler returns an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log the failure and move on without committing.
    ///
    /// The checkpoint is held at the position before the failed message for
    /// the rest of the run, so a restart redelivers the failed message and
    /// everything handled after it.
    #[default]
    LogAndContinue,

    /// Retry the handler with exponential backoff, then behave like
    /// `LogAndContinue`
    Retry {
        max_retries: u32,
        initial_delay_ms: u64,
        max_delay_ms: u64,
    },

    /// Park the message in the dead-letter sink and commit past it
    DeadLetter,

    /// Fault the consumer and surface the error
    Stop,
}

impl FailurePolicy {
    pub fn retry_delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            FailurePolicy::Retry {
                max_retries,
                initial_delay_ms,
                max_delay_ms,
            } if attempt < *max_retries => {
                Some(exponential_delay(*initial_delay_ms, *max_delay_ms, attempt))
            }
            _ => None,
        }
    }
}

/// Retry schedule for a failed ledger commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRetryConfig {
    /// Total attempts including the first
    /// Default: 5
    #[serde(default = "default_commit_attempts")]
    pub max_attempts: u32,

    /// Default: 50ms
    #[serde(default = "default_commit_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Default: 2000ms
    #[serde(default = "default_commit_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_commit_attempts() -> u32 {
    5
}

fn default_commit_initial_delay_ms() -> u64 {
    50
}

fn default_commit_max_delay_ms() -> u64 {
    2000
}

impl Default for CommitRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_commit_attempts(),
            initial_delay_ms: default_commit_initial_delay_ms(),
            max_delay_ms: default_commit_max_delay_ms(),
        }
    }
}

impl CommitRetryConfig {
    pub fn delay(&self, attempt: u32) -> Duration {
        exponential_delay(self.initial_delay_ms, self.max_delay_ms, attempt)
    }
}

/// Reconnect schedule for transient stream source failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Consecutive failed attempts before the error is surfaced
    /// Default: 10
    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,

    /// Default: 100ms
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Default: 5000ms
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_initial_delay_ms() -> u64 {
    100
}

fn default_reconnect_max_delay_ms() -> u64 {
    5000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_reconnect_attempts(),
            initial_delay_ms: default_reconnect_initial_delay_ms(),
            max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn delay(&self, attempt: u32) -> Duration {
        exponential_delay(self.initial_delay_ms, self.max_delay_ms, attempt)
    }
}

/// Configuration for a checkpointed consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Checkpoint name; independent consumers of one log use distinct names
    pub name: String,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default)]
    pub commit_retry: CommitRetryConfig,

    /// Lease time-to-live; the lease is renewed every third of it
    /// Default: 30s
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
}

fn default_lease_ttl_ms() -> u64 {
    30_000
}

impl ConsumerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_policy: FailurePolicy::default(),
            commit_retry: CommitRetryConfig::default(),
            lease_ttl_ms: default_lease_ttl_ms(),
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_commit_retry(mut self, retry: CommitRetryConfig) -> Self {
        self.commit_retry = retry;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(WaypointError::Config("checkpoint name must not be empty".into()));
        }
        if self.commit_retry.max_attempts == 0 {
            return Err(WaypointError::Config(
                "commit_retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.lease_ttl_ms < 3 {
            return Err(WaypointError::Config("lease_ttl_ms is too small".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let cfg: ConsumerConfig = serde_json::from_str(r#"{"name": "orders"}"#).unwrap();
        assert_eq!(cfg.name, "orders");
        assert_eq!(cfg.failure_policy, FailurePolicy::LogAndContinue);
        assert_eq!(cfg.commit_retry, CommitRetryConfig::default());
        assert_eq!(cfg.lease_ttl(), Duration::from_secs(30));
        cfg.validate().unwrap();
    }

    #[test]
    fn test_failure_policy_tagged_json() {
        let policy: FailurePolicy = serde_json::from_str(
            r#"{"kind": "retry", "max_retries": 2, "initial_delay_ms": 5, "max_delay_ms": 50}"#,
        )
        .unwrap();
        assert_eq!(policy.retry_delay(0), Some(Duration::from_millis(5)));
        assert_eq!(policy.retry_delay(1), Some(Duration::from_millis(10)));
        assert_eq!(policy.retry_delay(2), None);
        assert_eq!(FailurePolicy::DeadLetter.retry_delay(0), None);
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        assert!(ConsumerConfig::new("  ").validate().is_err());
        let cfg = ConsumerConfig::new("x").with_commit_retry(CommitRetryConfig {
            max_attempts: 0,
            ..Default::default()
        });
        assert!(cfg.validate().is_err());
    }
}
