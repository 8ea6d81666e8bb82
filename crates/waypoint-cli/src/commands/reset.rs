//! Reset command implementation

use anyhow::{Context, Result};
use std::path::PathBuf;
use waypoint::prelude::*;

pub async fn execute(ledger_path: PathBuf, name: &str, position: u64) -> Result<()> {
    let checkpoints = Checkpoints::open(&ledger_path).context("Failed to open ledger")?;
    let position = Position::new(position);

    let previous = checkpoints
        .position(name)
        .await
        .context("Failed to read checkpoint")?;

    checkpoints
        .ledger()
        .reset(name, position)
        .await
        .context("Failed to reset checkpoint")?;

    tracing::info!("Checkpoint '{}' reset to {}", name, position);
    match previous {
        Some(previous) => println!("✓ '{}': {} -> {}", name, previous, position),
        None => println!("✓ '{}' created at {}", name, position),
    }
    println!("The consumer resumes after {} on its next start", position);

    Ok(())
}
