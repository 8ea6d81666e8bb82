//! Waypoint Prelude
//!
//! Import this to get all commonly used types and traits:
//!
//! ```
//! use waypoint::prelude::*;
//! ```

// Core types
pub use crate::{
    DeadLetter, HandlerError, LeaseToken, LedgerEntry, Message, Position, Result, WaypointError,
};

// Configs
pub use crate::{
    CommitRetryConfig, ConsumerConfig, FailurePolicy, LedgerConfig, ReconnectConfig,
    SynchronousMode,
};

// Traits
pub use crate::{
    Consumer, DeadLetterSink, Delivery, LeaseStore, Ledger, MessageHandler, StreamSource,
    Subscription,
};

// Handlers
pub use crate::{handler_fn, FnHandler};

// Consumer
pub use crate::{
    CheckpointConsumer, ConsumerHandle, ConsumerState, ConsumerStats, ResubscribingSource,
    ShutdownHandle,
};

// Implementations
pub use crate::{
    in_memory_consumer, Checkpoints, MemoryConsumer, MemoryDeadLetters, MemoryLedger,
    MemoryStreamStore, SqliteDeadLetterQueue, SqliteLedger,
};

// Re-export common external deps
pub use anyhow;
pub use serde::{Deserialize, Serialize};
pub use std::sync::Arc;
pub use tracing;
