pub mod consumer;
pub mod ledger;

pub use consumer::{CommitRetryConfig, ConsumerConfig, FailurePolicy, ReconnectConfig};
pub use ledger::{LedgerConfig, SynchronousMode};

use std::time::Duration;

/// Exponential backoff: `initial * 2^attempt`, capped at `max`
pub(crate) fn exponential_delay(initial_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
    Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
}
