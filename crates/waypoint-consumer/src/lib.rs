//! Consumer: checkpointed subscription loop
//!
//! Reads the starting position from the ledger, subscribes to the stream
//! source, hands each message to the application handler and commits the
//! position only after the handler succeeded.
//!
//! Key features:
//! - Strict per-subscription ordering; one message in flight at a time
//! - Commit-after-handle, with bounded commit retry
//! - Configurable handler failure policy (continue, retry, dead-letter, stop)
//! - Exclusive commit lease, renewed in the background
//! - Graceful shutdown that lets the in-flight message finish
//! - Transparent resubscription after transient source failures

pub mod consumer;
pub mod handle;
pub mod resubscribe;
pub mod state;

pub use consumer::{CheckpointConsumer, Consumer};
pub use handle::{ConsumerHandle, ConsumerStats, ShutdownHandle};
pub use resubscribe::ResubscribingSource;
pub use state::ConsumerState;
