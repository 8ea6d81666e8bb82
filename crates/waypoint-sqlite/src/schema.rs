use rusqlite::Connection;
use tracing::info;
use waypoint_core::error::{Result, WaypointError};

/// Ordered schema migrations. Index + 1 is the schema version.
const MIGRATIONS: &[&str] = &[
    // 1: checkpoint ledger
    "CREATE TABLE IF NOT EXISTS ledger (
        name TEXT PRIMARY KEY NOT NULL,
        position INTEGER NOT NULL CHECK (position >= 0),
        updated_at TEXT NOT NULL
    )",
    // 2: exclusive commit leases
    "CREATE TABLE IF NOT EXISTS ledger_lease (
        name TEXT PRIMARY KEY NOT NULL,
        holder TEXT NOT NULL,
        acquired_at_ms INTEGER NOT NULL,
        expires_at_ms INTEGER NOT NULL
    )",
    // 3: dead letters
    "CREATE TABLE IF NOT EXISTS dead_letters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        checkpoint TEXT NOT NULL,
        position INTEGER NOT NULL,
        message_id TEXT NOT NULL,
        stream_id TEXT NOT NULL,
        message_type TEXT NOT NULL,
        payload BLOB NOT NULL,
        error_message TEXT NOT NULL,
        failed_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_dead_letters_checkpoint
        ON dead_letters(checkpoint, position)",
];

pub const LATEST_VERSION: u32 = MIGRATIONS.len() as u32;

fn sql_err(e: rusqlite::Error) -> WaypointError {
    WaypointError::Ledger(e.to_string())
}

/// Create the metadata table and apply every pending migration
pub fn init(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger_meta (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            schema_version INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )
    .map_err(sql_err)?;

    conn.execute(
        "INSERT OR IGNORE INTO ledger_meta (id, schema_version) VALUES (0, 0)",
        [],
    )
    .map_err(sql_err)?;

    migrate(conn, LATEST_VERSION)
}

pub fn schema_version(conn: &Connection) -> Result<u32> {
    conn.query_row(
        "SELECT schema_version FROM ledger_meta WHERE id = 0",
        [],
        |row| {
            let v: i64 = row.get(0)?;
            Ok(v as u32)
        },
    )
    .map_err(sql_err)
}

/// Apply migrations up to `target_version`, each in its own transaction.
///
/// Downgrades are refused.
pub fn migrate(conn: &mut Connection, target_version: u32) -> Result<()> {
    let current_version = schema_version(conn)?;

    if target_version < current_version {
        return Err(WaypointError::InvalidState(format!(
            "Cannot downgrade ledger schema from {} to {}",
            current_version, target_version
        )));
    }
    if target_version > LATEST_VERSION {
        return Err(WaypointError::Config(format!(
            "Unknown ledger schema version {} (latest is {})",
            target_version, LATEST_VERSION
        )));
    }

    for version in (current_version + 1)..=target_version {
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute_batch(MIGRATIONS[(version - 1) as usize])
            .map_err(sql_err)?;
        tx.execute(
            "UPDATE ledger_meta SET schema_version = ?1, updated_at = datetime('now') WHERE id = 0",
            [version as i64],
        )
        .map_err(sql_err)?;
        tx.commit().map_err(sql_err)?;
        info!("Applied ledger schema migration {}", version);
    }

    Ok(())
}
