use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Message, Position};

/// One item delivered by a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Message(Message),
    /// The historical backlog is exhausted; live tailing begins
    CaughtUp,
}

/// Globally ordered, append-only log that supports subscribe-from-position
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Open a subscription delivering every message with position strictly
    /// greater than `from_exclusive`, in increasing position order.
    ///
    /// Historical messages come first, followed by exactly one
    /// [`Delivery::CaughtUp`], followed by live messages as they are appended.
    async fn subscribe(&self, from_exclusive: Position) -> Result<Box<dyn Subscription>>;

    /// Position of the newest message in the log, if any
    async fn head_position(&self) -> Result<Option<Position>>;
}

/// An open subscription.
///
/// Pull-based: the source never delivers the next message before the caller
/// asks for it, which keeps a slow handler from being outpaced.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. `Ok(None)` means the source closed.
    ///
    /// Must be cancel-safe: dropping the future before it completes loses no
    /// message.
    async fn next(&mut self) -> Result<Option<Delivery>>;

    /// Position of the last message delivered, or the starting position if
    /// nothing has been delivered yet
    fn last_position(&self) -> Position;
}
