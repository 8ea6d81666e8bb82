//! Status and show command implementations

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use waypoint::prelude::*;

pub async fn execute(ledger_path: PathBuf) -> Result<()> {
    tracing::info!("Checking ledger status: {}", ledger_path.display());

    let checkpoints = Checkpoints::open(&ledger_path).context("Failed to open ledger")?;

    println!("\nLedger Status");
    println!("{}", "=".repeat(60));
    println!("Path: {}", ledger_path.display());

    let schema_version = checkpoints
        .ledger()
        .schema_version()
        .context("Failed to get schema version")?;
    println!("Schema Version: {}", schema_version);

    let entries = checkpoints
        .entries()
        .await
        .context("Failed to list checkpoints")?;
    println!("\nCheckpoints:");
    if entries.is_empty() {
        println!("  (none)");
    }
    for entry in &entries {
        let updated = entry
            .updated_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!("  {:<24} {:>12}  {}", entry.name, entry.position, updated);
    }

    let leases = checkpoints
        .ledger()
        .leases()
        .await
        .context("Failed to list leases")?;
    println!("\nLeases:");
    if leases.is_empty() {
        println!("  (none)");
    }
    for lease in &leases {
        let expired = if lease.is_expired() {
            " (expired)"
        } else {
            ""
        };
        println!(
            "  {:<24} held by {} until {}{}",
            lease.name,
            lease.holder,
            lease.expires_at.to_rfc3339(),
            expired
        );
    }

    let dead_letters = checkpoints
        .dead_letters()
        .count()
        .await
        .context("Failed to count dead letters")?;
    if dead_letters > 0 {
        println!("\n⚠️  {} dead-lettered message(s)", dead_letters);
        println!("Run 'waypoint dead-letters' to inspect them");
    } else {
        println!("\n✓ No dead-lettered messages");
    }

    Ok(())
}

pub async fn show(ledger_path: PathBuf, name: &str) -> Result<()> {
    let checkpoints = Checkpoints::open(&ledger_path).context("Failed to open ledger")?;

    let entry = checkpoints
        .entries()
        .await
        .context("Failed to read checkpoints")?
        .into_iter()
        .find(|entry| entry.name == name);

    let Some(entry) = entry else {
        bail!("No checkpoint named '{}' in {}", name, ledger_path.display());
    };

    println!("Checkpoint: {}", entry.name);
    println!("Position:   {}", entry.position);
    if let Some(updated_at) = entry.updated_at {
        println!("Updated:    {}", updated_at.to_rfc3339());
    }

    let parked = checkpoints
        .dead_letters()
        .for_checkpoint(name)
        .await
        .context("Failed to read dead letters")?;
    if !parked.is_empty() {
        println!("Dead letters: {}", parked.len());
    }

    Ok(())
}
