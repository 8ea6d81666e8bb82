//! Waypoint: checkpointed consumers for durable, globally ordered event logs
//!
//! Waypoint subscribes to an ordered log, hands each message to application
//! logic, and durably records how far processing got so that a restart
//! resumes exactly where it left off:
//! - **Ledger**: durable `name -> last committed position` store (SQLite)
//! - **Stream source**: catch-up over history, then live tailing
//! - **Consumer**: commit-after-handle loop with failure policies and an
//!   exclusive commit lease
//! - **Dead letters**: parking lot for messages that could not be handled
//!
//! Delivery is at-least-once. Handlers must be idempotent or deduplicate on
//! [`Message::message_id`].
//!
//! # Quick Start
//!
//! ```no_run
//! use waypoint::prelude::*;
//!
//! # async fn run() -> Result<()> {
//! let checkpoints = Checkpoints::open("./ledger.db")?;
//! let log = Arc::new(MemoryStreamStore::default());
//!
//! let consumer = checkpoints.consumer(log.clone(), ConsumerConfig::new("orders"));
//! let handle = consumer
//!     .start_exclusive(Arc::new(handler_fn(|message: Message| async move {
//!         tracing::info!("{} at {}", message.message_type, message.position);
//!         Ok(())
//!     })))
//!     .await?;
//!
//! log.append("order-1", "OrderPlaced", br#"{"total": 10}"#.to_vec())?;
//! handle.wait_for_commit(Position::new(1)).await?;
//! handle.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod checkpoints;
pub mod prelude;

// Re-export core types
pub use waypoint_core::{
    config::{
        CommitRetryConfig, ConsumerConfig, FailurePolicy, LedgerConfig, ReconnectConfig,
        SynchronousMode,
    },
    error::{HandlerError, Result, WaypointError},
    observe,
    traits::{
        handler_fn, DeadLetterSink, Delivery, FnHandler, LeaseStore, Ledger, MessageHandler,
        StreamSource, Subscription,
    },
    types::{DeadLetter, LeaseToken, LedgerEntry, Message, Position},
};

// Re-export implementations
pub use waypoint_consumer::{
    CheckpointConsumer, Consumer, ConsumerHandle, ConsumerState, ConsumerStats,
    ResubscribingSource, ShutdownHandle,
};
pub use waypoint_memory::{
    MemoryDeadLetters, MemoryLedger, MemoryStreamConfig, MemoryStreamStats, MemoryStreamStore,
    MemorySubscription,
};
pub use waypoint_sqlite::{SqliteDeadLetterQueue, SqliteLedger};

// Re-export main types from this crate
pub use checkpoints::Checkpoints;

/// The in-memory consumer variant
pub type MemoryConsumer = CheckpointConsumer<MemoryLedger, MemoryStreamStore>;

/// Build a consumer over an in-memory log and ledger.
///
/// Clones of `ledger` and `log` share state with the originals, so a caller
/// can append to the log and inspect checkpoints while the consumer runs, or
/// build a second consumer over the same ledger to play a restart.
pub fn in_memory_consumer(
    name: impl Into<String>,
    ledger: &MemoryLedger,
    log: &MemoryStreamStore,
) -> MemoryConsumer {
    CheckpointConsumer::new(
        std::sync::Arc::new(ledger.clone()),
        std::sync::Arc::new(log.clone()),
        ConsumerConfig::new(name),
    )
}
