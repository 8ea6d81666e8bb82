use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Position;

/// One checkpoint row: the last committed position of a named consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub name: String,
    pub position: Position,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Proof that the bearer holds the exclusive commit lease for `name`.
///
/// Issued by a [`LeaseStore`](crate::traits::LeaseStore); a consumer refuses
/// to start without one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken {
    pub name: String,
    pub holder: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// A message parked after its handler failed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: i64,
    pub checkpoint: String,
    pub position: Position,
    pub message_id: Uuid,
    pub stream_id: String,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
}
