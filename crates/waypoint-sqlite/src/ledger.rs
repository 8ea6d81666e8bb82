use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;
use waypoint_core::{
    error::{Result, WaypointError},
    traits::Ledger,
    types::{LedgerEntry, Position},
    LedgerConfig,
};

use crate::dead_letter::SqliteDeadLetterQueue;
use crate::schema;

pub(crate) fn sql_err(e: rusqlite::Error) -> WaypointError {
    WaypointError::Ledger(e.to_string())
}

/// SQLite-backed checkpoint ledger
///
/// Every SQLite call runs on the blocking thread pool so a slow fsync never
/// stalls the async runtime.
#[derive(Clone)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
    config: LedgerConfig,
}

impl SqliteLedger {
    /// Open (or create) the ledger database and bring its schema up to date
    pub fn open(cfg: LedgerConfig) -> Result<Self> {
        if let Some(parent) = cfg.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open_with_flags(
            &cfg.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(sql_err)?;

        Self::configure_connection(&conn, &cfg)?;
        schema::init(&mut conn)?;

        tracing::debug!("Opened ledger at {}", cfg.path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config: cfg,
        })
    }

    /// In-memory database, for tests and demos
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().map_err(sql_err)?;
        schema::init(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config: LedgerConfig::new(":memory:"),
        })
    }

    fn configure_connection(conn: &Connection, cfg: &LedgerConfig) -> Result<()> {
        if cfg.wal_mode {
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|e| WaypointError::Config(e.to_string()))?;
        }

        conn.pragma_update(None, "synchronous", cfg.synchronous.as_pragma())
            .map_err(|e| WaypointError::Config(e.to_string()))?;

        conn.busy_timeout(Duration::from_millis(cfg.busy_timeout_ms))
            .map_err(|e| WaypointError::Config(e.to_string()))?;

        Ok(())
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn schema_version(&self) -> Result<u32> {
        let conn = self.conn.lock();
        schema::schema_version(&conn)
    }

    /// Dead-letter queue stored in the same database
    pub fn dead_letter_queue(&self) -> SqliteDeadLetterQueue {
        SqliteDeadLetterQueue::new(self.conn.clone())
    }

    /// Run `f` against the connection on the blocking pool
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        run_blocking(self.conn.clone(), f).await
    }
}

pub(crate) async fn run_blocking<T, F>(conn: Arc<Mutex<Connection>>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = conn.lock();
        f(&mut guard)
    })
    .await
    .map_err(|e| WaypointError::Ledger(format!("ledger task failed: {}", e)))?
}

pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn init(&self, name: &str) -> Result<Position> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO ledger (name, position, updated_at) VALUES (?1, 0, ?2)",
                params![name, Utc::now().to_rfc3339()],
            )
            .map_err(sql_err)?;

            let stored: i64 = conn
                .query_row(
                    "SELECT position FROM ledger WHERE name = ?1",
                    [&name],
                    |row| row.get(0),
                )
                .map_err(sql_err)?;

            Position::from_sql(stored)
        })
        .await
    }

    async fn commit(&self, name: &str, position: Position) -> Result<()> {
        let name = name.to_string();
        let value = position.to_sql()?;
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE ledger SET position = ?1, updated_at = ?2 WHERE name = ?3",
                    params![value, Utc::now().to_rfc3339(), name],
                )
                .map_err(sql_err)?;

            if updated == 0 {
                return Err(WaypointError::NotFound(format!(
                    "ledger entry '{}' was never initialized",
                    name
                )));
            }
            Ok(())
        })
        .await
    }

    async fn read(&self, name: &str) -> Result<Option<Position>> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let stored: Option<i64> = conn
                .query_row(
                    "SELECT position FROM ledger WHERE name = ?1",
                    [&name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;

            stored.map(Position::from_sql).transpose()
        })
        .await
    }

    async fn entries(&self) -> Result<Vec<LedgerEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT name, position, updated_at FROM ledger ORDER BY name")
                .map_err(sql_err)?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(sql_err)?;

            let mut entries = Vec::new();
            for row in rows {
                let (name, position, updated_at) = row.map_err(sql_err)?;
                entries.push(LedgerEntry {
                    name,
                    position: Position::from_sql(position)?,
                    updated_at: parse_timestamp(&updated_at),
                });
            }
            Ok(entries)
        })
        .await
    }

    async fn reset(&self, name: &str, position: Position) -> Result<()> {
        let name = name.to_string();
        let value = position.to_sql()?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO ledger (name, position, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET
                    position = excluded.position,
                    updated_at = excluded.updated_at",
                params![name, value, Utc::now().to_rfc3339()],
            )
            .map_err(sql_err)?;
            tracing::warn!("Checkpoint '{}' reset to {}", name, position);
            Ok(())
        })
        .await
    }
}
