//! Account Balance Example
//!
//! Projects deposits and withdrawals from an in-memory log into a running
//! balance, checkpointing into a SQLite ledger. The log is rebuilt on every
//! run while the ledger persists, so a second run resumes after the stored
//! position and handles nothing.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example account_balance
//! ```

use serde::Deserialize;
use std::sync::atomic::{AtomicI64, Ordering};
use waypoint::prelude::*;

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum AccountEvent {
    Deposited { amount: i64 },
    Withdrawn { amount: i64 },
}

struct Balance {
    cents: AtomicI64,
}

#[async_trait::async_trait]
impl MessageHandler for Balance {
    async fn handle(&self, message: &Message) -> std::result::Result<(), HandlerError> {
        let delta = match message.json_data::<AccountEvent>()? {
            AccountEvent::Deposited { amount } => amount,
            AccountEvent::Withdrawn { amount } => -amount,
        };
        let balance = self.cents.fetch_add(delta, Ordering::SeqCst) + delta;
        tracing::info!("{} at {}: balance {}", message.message_type, message.position, balance);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let checkpoints = Checkpoints::open("./data/account.db")?;
    let log = Arc::new(MemoryStreamStore::default());
    for amount in [100, 250, 75] {
        log.append_json(
            "account-1",
            "Deposited",
            &serde_json::json!({ "kind": "deposited", "amount": amount }),
        )?;
    }
    log.append_json(
        "account-1",
        "Withdrawn",
        &serde_json::json!({ "kind": "withdrawn", "amount": 120 }),
    )?;

    let handler = Arc::new(Balance {
        cents: AtomicI64::new(0),
    });
    let handle = checkpoints
        .consumer(log.clone(), ConsumerConfig::new("account-balance"))
        .start_exclusive(handler.clone())
        .await?;

    handle.wait_for_state(ConsumerState::Live).await;
    tracing::info!("Caught up; checkpoint at {}", handle.committed());

    let stats = handle.stop().await?;
    tracing::info!(
        "Stopped after {} message(s); final balance {}",
        stats.delivered,
        handler.cents.load(Ordering::SeqCst)
    );
    Ok(())
}
