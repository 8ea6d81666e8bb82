//! Waypoint Core: traits and types for checkpointed event-log consumers
//!
//! This crate defines the abstractions shared by every waypoint component:
//! - Ledger: durable `name -> last committed position` store
//! - Lease store: exclusive commit lease per checkpoint name
//! - Stream source: globally ordered log with catch-up then live tailing
//! - Message handler: application logic, invoked once per delivered message
//! - Dead-letter sink: parking lot for messages that could not be handled
//!
//! Key guarantees the consumer builds on top of these seams:
//! - Positions are delivered strictly increasing within one subscription
//! - A position is committed only after its handler has completed successfully
//! - A restart resumes strictly after the last committed position

pub mod config;
pub mod error;
pub mod observe;
pub mod traits;
pub mod types;

pub use config::{
    CommitRetryConfig, ConsumerConfig, FailurePolicy, LedgerConfig, ReconnectConfig,
    SynchronousMode,
};
pub use error::{HandlerError, Result, WaypointError};
pub use traits::{
    handler_fn, DeadLetterSink, Delivery, FnHandler, Ledger, LeaseStore, MessageHandler,
    StreamSource, Subscription,
};
pub use types::{DeadLetter, LeaseToken, LedgerEntry, Message, Position};
