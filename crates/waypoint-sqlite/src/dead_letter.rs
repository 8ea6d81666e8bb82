//! Dead Letter Queue
//!
//! Stores messages whose handler failed, for later analysis and replay.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::sync::Arc;
use uuid::Uuid;
use waypoint_core::{
    error::{HandlerError, Result, WaypointError},
    traits::DeadLetterSink,
    types::{DeadLetter, Message, Position},
};

use crate::ledger::{parse_timestamp, run_blocking};

fn dlq_err(e: rusqlite::Error) -> WaypointError {
    WaypointError::DeadLetter(e.to_string())
}

/// Dead letter queue living in the ledger database
#[derive(Clone)]
pub struct SqliteDeadLetterQueue {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDeadLetterQueue {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Dead letters recorded for one checkpoint, oldest position first
    pub async fn for_checkpoint(&self, checkpoint: &str) -> Result<Vec<DeadLetter>> {
        let checkpoint = checkpoint.to_string();
        run_blocking(self.conn.clone(), move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, checkpoint, position, message_id, stream_id, message_type,
                            payload, error_message, failed_at
                     FROM dead_letters WHERE checkpoint = ?1 ORDER BY position",
                )
                .map_err(dlq_err)?;
            let rows = stmt.query_map([&checkpoint], read_row).map_err(dlq_err)?;
            collect(rows)
        })
        .await
    }
}

type RawRow = (i64, String, i64, String, String, String, Vec<u8>, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn collect<I>(rows: I) -> Result<Vec<DeadLetter>>
where
    I: Iterator<Item = rusqlite::Result<RawRow>>,
{
    let mut letters = Vec::new();
    for row in rows {
        let (id, checkpoint, position, message_id, stream_id, message_type, payload, error, at) =
            row.map_err(dlq_err)?;
        letters.push(DeadLetter {
            id,
            checkpoint,
            position: Position::from_sql(position)?,
            message_id: Uuid::parse_str(&message_id)
                .map_err(|e| WaypointError::DeadLetter(e.to_string()))?,
            stream_id,
            message_type,
            payload,
            error_message: error,
            failed_at: parse_timestamp(&at).unwrap_or_else(Utc::now),
        });
    }
    Ok(letters)
}

#[async_trait]
impl DeadLetterSink for SqliteDeadLetterQueue {
    async fn record(
        &self,
        checkpoint: &str,
        message: &Message,
        error: &HandlerError,
    ) -> Result<i64> {
        let checkpoint = checkpoint.to_string();
        let position = message.position.to_sql()?;
        let message_id = message.message_id.to_string();
        let stream_id = message.stream_id.clone();
        let message_type = message.message_type.clone();
        let payload = message.payload().to_vec();
        let error_message = error.to_string();

        run_blocking(self.conn.clone(), move |conn| {
            conn.execute(
                "INSERT INTO dead_letters
                    (checkpoint, position, message_id, stream_id, message_type,
                     payload, error_message, failed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    checkpoint,
                    position,
                    message_id,
                    stream_id,
                    message_type,
                    payload,
                    error_message,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(dlq_err)?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        run_blocking(self.conn.clone(), move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, checkpoint, position, message_id, stream_id, message_type,
                            payload, error_message, failed_at
                     FROM dead_letters ORDER BY id DESC LIMIT ?1",
                )
                .map_err(dlq_err)?;
            let rows = stmt.query_map([limit as i64], read_row).map_err(dlq_err)?;
            collect(rows)
        })
        .await
    }

    async fn count(&self) -> Result<usize> {
        run_blocking(self.conn.clone(), |conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))
                .map_err(dlq_err)?;
            Ok(count as usize)
        })
        .await
    }

    async fn remove(&self, id: i64) -> Result<()> {
        run_blocking(self.conn.clone(), move |conn| {
            conn.execute("DELETE FROM dead_letters WHERE id = ?1", [id])
                .map_err(dlq_err)?;
            Ok(())
        })
        .await
    }
}
