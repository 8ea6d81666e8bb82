//! SQLite-backed checkpoint ledger
//!
//! Stores one row per checkpoint name holding the last committed position.
//!
//! Key features:
//! - Create-if-absent initialization that never overwrites
//! - Exclusive commit lease per checkpoint name
//! - Dead-letter queue sharing the ledger database
//! - Versioned schema migrations
//! - WAL mode and configurable fsync policy

pub mod dead_letter;
pub mod lease;
pub mod ledger;
pub mod schema;

pub use dead_letter::SqliteDeadLetterQueue;
pub use ledger::SqliteLedger;
