use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use uuid::Uuid;

use super::Position;
use crate::error::{Result, WaypointError};

/// An immutable message read from the log.
///
/// Produced only by a stream source. The payload is kept as raw bytes and
/// decoded on demand, so handlers that only look at the type tag never pay for
/// deserialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_id: Uuid,
    /// Origin stream this message was appended to
    pub stream_id: String,
    /// Per-stream sequence number, starting at 0
    pub stream_version: u64,
    /// Global position across the whole log
    pub position: Position,
    pub created_at: DateTime<Utc>,
    pub message_type: String,
    payload: Arc<[u8]>,
}

impl Message {
    pub fn new(
        message_id: Uuid,
        stream_id: impl Into<String>,
        stream_version: u64,
        position: Position,
        created_at: DateTime<Utc>,
        message_type: impl Into<String>,
        payload: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            message_id,
            stream_id: stream_id.into(),
            stream_version,
            position,
            created_at,
            message_type: message_type.into(),
            payload: payload.into(),
        }
    }

    /// Raw payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload as JSON into `T`
    pub fn json_data<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            WaypointError::Serialization(format!(
                "message {} at position {}: {}",
                self.message_id, self.position, e
            ))
        })
    }

    /// Decode the payload as an untyped JSON value
    pub fn json_value(&self) -> Result<serde_json::Value> {
        self.json_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Deposited {
        amount: u64,
    }

    fn message(payload: &[u8]) -> Message {
        Message::new(
            Uuid::new_v4(),
            "account-1",
            0,
            Position::new(3),
            Utc::now(),
            "deposited",
            payload.to_vec(),
        )
    }

    #[test]
    fn test_json_data_decodes_lazily() {
        let msg = message(br#"{"amount": 25}"#);
        assert_eq!(msg.json_data::<Deposited>().unwrap(), Deposited { amount: 25 });
        assert_eq!(msg.json_value().unwrap()["amount"], 25);
    }

    #[test]
    fn test_json_data_reports_position() {
        let msg = message(b"not json");
        let err = msg.json_data::<Deposited>().unwrap_err();
        assert!(matches!(err, WaypointError::Serialization(_)));
        assert!(err.to_string().contains("position 3"));
    }
}
