use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{LeaseToken, LedgerEntry, Position};

/// Durable checkpoint store: `name -> last committed position`
///
/// Pure persistence. The ledger performs no ordering checks; the consumer is
/// responsible for only committing increasing positions for a name.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Ensure an entry exists for `name` and return its stored position.
    ///
    /// Creates the entry at [`Position::START`] if absent and never overwrites
    /// an existing one, so repeated or concurrent calls are safe.
    async fn init(&self, name: &str) -> Result<Position>;

    /// Durably overwrite the stored position for `name`.
    ///
    /// Fails with `NotFound` if `name` was never initialized.
    async fn commit(&self, name: &str, position: Position) -> Result<()>;

    /// Point read; `None` if no entry exists
    async fn read(&self, name: &str) -> Result<Option<Position>>;

    /// All entries, ordered by name
    async fn entries(&self) -> Result<Vec<LedgerEntry>>;

    /// Operator overwrite, creating the entry if needed.
    ///
    /// Not used by the consumer loop; rewinding a live consumer's checkpoint
    /// causes redelivery on its next restart.
    async fn reset(&self, name: &str, position: Position) -> Result<()>;
}

/// Exclusive commit lease per checkpoint name
///
/// At most one consumer may commit under a name at a time. A lease expires
/// after its TTL unless renewed, so a crashed holder does not block others
/// forever.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquire the lease for `name` on behalf of `holder`.
    ///
    /// Succeeds if the lease is free, expired, or already held by `holder`.
    /// Fails with `LeaseHeld` otherwise.
    async fn acquire(&self, name: &str, holder: Uuid, ttl: Duration) -> Result<LeaseToken>;

    /// Extend a lease the caller still holds
    async fn renew(&self, token: &LeaseToken, ttl: Duration) -> Result<LeaseToken>;

    /// Release the lease. Releasing a lease held by someone else is a no-op.
    async fn release(&self, token: &LeaseToken) -> Result<()>;

    /// Check the token still names the current, unexpired holder
    async fn verify(&self, token: &LeaseToken) -> Result<bool>;
}
