//! In-memory waypoint backends
//!
//! Provides a globally ordered event log and a checkpoint ledger that live
//! entirely in process memory. They implement the same traits as the durable
//! backends, so a consumer can be exercised end-to-end without an external
//! log or database.
//!
//! Features:
//! - Catch-up then live tailing, woken by `tokio::sync::Notify` on append
//! - Sparse positions via `append_at`
//! - Fault injection: transient disconnects, refused subscriptions,
//!   failing commits and a failing init
//! - Commit history for asserting checkpoint progression

mod dead_letter;
mod ledger;
mod stream;

pub use dead_letter::MemoryDeadLetters;
pub use ledger::MemoryLedger;
pub use stream::{MemoryStreamConfig, MemoryStreamStats, MemoryStreamStore, MemorySubscription};
