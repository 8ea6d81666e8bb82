use async_trait::async_trait;

use crate::error::{HandlerError, Result};
use crate::types::{DeadLetter, Message};

/// Storage for messages whose handler failed.
///
/// Once a message is recorded here it counts as resolved for checkpointing:
/// the consumer may commit past it, because the failure is no longer silent.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Record a failed message, returning the dead letter id
    async fn record(&self, checkpoint: &str, message: &Message, error: &HandlerError)
        -> Result<i64>;

    /// Most recent dead letters first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    async fn count(&self) -> Result<usize>;

    async fn remove(&self, id: i64) -> Result<()>;
}
