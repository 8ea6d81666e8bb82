//! Dead-letters command implementation

use anyhow::{Context, Result};
use std::path::PathBuf;
use waypoint::prelude::*;

pub async fn execute(ledger_path: PathBuf, limit: usize, checkpoint: Option<String>) -> Result<()> {
    let checkpoints = Checkpoints::open(&ledger_path).context("Failed to open ledger")?;
    let queue = checkpoints.dead_letters();

    let mut parked = match &checkpoint {
        Some(name) => queue
            .for_checkpoint(name)
            .await
            .context("Failed to read dead letters")?,
        None => queue
            .list(limit)
            .await
            .context("Failed to read dead letters")?,
    };
    parked.truncate(limit);

    if parked.is_empty() {
        println!("No dead-lettered messages");
        return Ok(());
    }

    println!(
        "{:>6}  {:<16} {:>10}  {:<20} {:<20} failed at",
        "id", "checkpoint", "position", "stream", "type"
    );
    for letter in &parked {
        println!(
            "{:>6}  {:<16} {:>10}  {:<20} {:<20} {}",
            letter.id,
            letter.checkpoint,
            letter.position,
            letter.stream_id,
            letter.message_type,
            letter.failed_at.to_rfc3339()
        );
        println!("        error: {}", letter.error_message);
        if let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&letter.payload) {
            println!("        payload: {}", payload);
        }
    }

    let total = queue.count().await.context("Failed to count dead letters")?;
    if total > parked.len() {
        println!("\n({} of {} shown)", parked.len(), total);
    }

    Ok(())
}
