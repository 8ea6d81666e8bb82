//! Unified checkpoint storage
//!
//! Bundles the SQLite ledger, its lease table and the dead-letter queue that
//! share one database file, and builds durable consumers on top of them.

use crate::{
    CheckpointConsumer, ConsumerConfig, DeadLetterSink, LedgerConfig, LedgerEntry, Ledger,
    Position, Result, SqliteDeadLetterQueue, SqliteLedger, StreamSource,
};
use std::path::Path;
use std::sync::Arc;

/// SQLite ledger plus dead-letter queue
#[derive(Clone)]
pub struct Checkpoints {
    ledger: Arc<SqliteLedger>,
    dead_letters: Arc<SqliteDeadLetterQueue>,
}

impl Checkpoints {
    /// Open (or create) the ledger database at `path` with default settings
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(LedgerConfig::new(path.as_ref()))
    }

    pub fn open_with_config(config: LedgerConfig) -> Result<Self> {
        Ok(Self::from_ledger(SqliteLedger::open(config)?))
    }

    /// Ledger backed by an in-memory SQLite database
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_ledger(SqliteLedger::open_in_memory()?))
    }

    fn from_ledger(ledger: SqliteLedger) -> Self {
        let dead_letters = Arc::new(ledger.dead_letter_queue());
        Self {
            ledger: Arc::new(ledger),
            dead_letters,
        }
    }

    pub fn ledger(&self) -> &Arc<SqliteLedger> {
        &self.ledger
    }

    pub fn dead_letters(&self) -> &Arc<SqliteDeadLetterQueue> {
        &self.dead_letters
    }

    /// Build a consumer that checkpoints into this ledger.
    ///
    /// The dead-letter queue is attached, so [`FailurePolicy::DeadLetter`]
    /// works without further setup.
    ///
    /// [`FailurePolicy::DeadLetter`]: crate::FailurePolicy::DeadLetter
    pub fn consumer<S>(
        &self,
        source: Arc<S>,
        config: ConsumerConfig,
    ) -> CheckpointConsumer<SqliteLedger, S>
    where
        S: StreamSource + 'static,
    {
        let sink: Arc<dyn DeadLetterSink> = self.dead_letters.clone();
        CheckpointConsumer::new(self.ledger.clone(), source, config).with_dead_letters(sink)
    }

    /// Stored position for `name`, if the checkpoint exists
    pub async fn position(&self, name: &str) -> Result<Option<Position>> {
        self.ledger.read(name).await
    }

    pub async fn entries(&self) -> Result<Vec<LedgerEntry>> {
        self.ledger.entries().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_schema_and_dead_letter_queue() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = Checkpoints::open(dir.path().join("nested/ledger.db")).unwrap();

        assert!(checkpoints.entries().await.unwrap().is_empty());
        assert_eq!(checkpoints.position("orders").await.unwrap(), None);
        assert_eq!(checkpoints.dead_letters().count().await.unwrap(), 0);

        checkpoints.ledger().init("orders").await.unwrap();
        assert_eq!(
            checkpoints.position("orders").await.unwrap(),
            Some(Position::START)
        );
    }
}
