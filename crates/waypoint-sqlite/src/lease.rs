//! Exclusive commit lease backed by the `ledger_lease` table

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::time::Duration;
use uuid::Uuid;
use waypoint_core::{
    error::{Result, WaypointError},
    traits::LeaseStore,
    types::LeaseToken,
};

use crate::ledger::{sql_err, SqliteLedger};

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| WaypointError::Lease(format!("invalid lease timestamp {}", ms)))
}

fn parse_holder(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| WaypointError::Lease(format!("invalid holder: {}", e)))
}

fn ttl_delta(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl).map_err(|e| WaypointError::Config(e.to_string()))
}

impl SqliteLedger {
    /// Every lease row, including expired ones
    pub async fn leases(&self) -> Result<Vec<LeaseToken>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name, holder, acquired_at_ms, expires_at_ms
                     FROM ledger_lease ORDER BY name",
                )
                .map_err(sql_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .map_err(sql_err)?;

            let mut leases = Vec::new();
            for row in rows {
                let (name, holder, acquired, expires) = row.map_err(sql_err)?;
                leases.push(LeaseToken {
                    name,
                    holder: parse_holder(&holder)?,
                    acquired_at: from_millis(acquired)?,
                    expires_at: from_millis(expires)?,
                });
            }
            Ok(leases)
        })
        .await
    }
}

#[async_trait]
impl LeaseStore for SqliteLedger {
    async fn acquire(&self, name: &str, holder: Uuid, ttl: Duration) -> Result<LeaseToken> {
        let name = name.to_string();
        let delta = ttl_delta(ttl)?;
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
                .map_err(sql_err)?;

            let now = Utc::now();
            let current: Option<(String, i64)> = tx
                .query_row(
                    "SELECT holder, expires_at_ms FROM ledger_lease WHERE name = ?1",
                    [&name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(sql_err)?;

            if let Some((current_holder, expires_ms)) = current {
                let other = parse_holder(&current_holder)? != holder;
                if other && expires_ms > now.timestamp_millis() {
                    return Err(WaypointError::LeaseHeld {
                        name,
                        holder: current_holder,
                    });
                }
            }

            let token = LeaseToken {
                name,
                holder,
                acquired_at: now,
                expires_at: now + delta,
            };
            tx.execute(
                "INSERT INTO ledger_lease (name, holder, acquired_at_ms, expires_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                    holder = excluded.holder,
                    acquired_at_ms = excluded.acquired_at_ms,
                    expires_at_ms = excluded.expires_at_ms",
                params![
                    token.name,
                    token.holder.to_string(),
                    token.acquired_at.timestamp_millis(),
                    token.expires_at.timestamp_millis()
                ],
            )
            .map_err(sql_err)?;
            tx.commit().map_err(sql_err)?;

            tracing::info!("Lease for '{}' acquired by {}", token.name, token.holder);
            Ok(token)
        })
        .await
    }

    async fn renew(&self, token: &LeaseToken, ttl: Duration) -> Result<LeaseToken> {
        let mut renewed = token.clone();
        renewed.expires_at = Utc::now() + ttl_delta(ttl)?;
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE ledger_lease SET expires_at_ms = ?1 WHERE name = ?2 AND holder = ?3",
                    params![
                        renewed.expires_at.timestamp_millis(),
                        renewed.name,
                        renewed.holder.to_string()
                    ],
                )
                .map_err(sql_err)?;
            if updated == 0 {
                return Err(WaypointError::Lease(format!(
                    "lease for '{}' is no longer held by {}",
                    renewed.name, renewed.holder
                )));
            }
            Ok(renewed)
        })
        .await
    }

    async fn release(&self, token: &LeaseToken) -> Result<()> {
        let name = token.name.clone();
        let holder = token.holder.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM ledger_lease WHERE name = ?1 AND holder = ?2",
                params![name, holder],
            )
            .map_err(sql_err)?;
            Ok(())
        })
        .await
    }

    async fn verify(&self, token: &LeaseToken) -> Result<bool> {
        let name = token.name.clone();
        let holder = token.holder;
        self.with_conn(move |conn| {
            let current: Option<(String, i64)> = conn
                .query_row(
                    "SELECT holder, expires_at_ms FROM ledger_lease WHERE name = ?1",
                    [&name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(sql_err)?;

            Ok(match current {
                Some((current_holder, expires_ms)) => {
                    parse_holder(&current_holder)? == holder
                        && expires_ms > Utc::now().timestamp_millis()
                }
                None => false,
            })
        })
        .await
    }
}
