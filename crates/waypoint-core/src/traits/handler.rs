use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::error::HandlerError;
use crate::types::Message;

/// Application logic invoked once per delivered message.
///
/// Delivery is at-least-once: a message may be handled again after a restart,
/// so implementations must be idempotent or deduplicate on
/// [`Message::message_id`].
///
/// # Example
///
/// ```
/// use waypoint_core::{HandlerError, Message, MessageHandler};
///
/// struct PrintHandler;
///
/// #[async_trait::async_trait]
/// impl MessageHandler for PrintHandler {
///     async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
///         println!("{} @ {}", message.message_type, message.position);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (**self).handle(message).await
    }
}

/// Handler backed by an async closure; see [`handler_fn`]
pub struct FnHandler<F> {
    f: F,
}

/// Build a handler from an async closure taking an owned message
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        (self.f)(message.clone()).await
    }
}
