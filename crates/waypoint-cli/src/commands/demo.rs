//! Demo command implementation
//!
//! Publishes into an in-memory log, consumes it with the SQLite ledger, and
//! restarts once to show the checkpoint carrying over.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use waypoint::prelude::*;

/// Pause between live appends, so tailing is visible
const PUBLISH_INTERVAL: Duration = Duration::from_millis(100);

fn publish(log: &MemoryStreamStore, seq: u64) -> Result<()> {
    let order = serde_json::json!({ "order": seq, "amount": seq * 10 });
    log.append_json(&format!("order-{}", seq), "OrderPlaced", &order)
        .context("Failed to append to log")?;
    Ok(())
}

fn printing_handler(fail_at: Option<Position>) -> Arc<dyn MessageHandler> {
    Arc::new(handler_fn(move |message: Message| async move {
        if Some(message.position) == fail_at {
            println!("  ✗ {:>4}  {} (injected failure)", message.position, message.message_type);
            return Err(HandlerError::rejected(format!(
                "injected failure at {}",
                message.position
            )));
        }
        let body = message.json_value()?;
        println!("  ✓ {:>4}  {} {}", message.position, message.message_type, body);
        Ok(())
    }))
}

/// Wait until the consumer has seen `count` messages, it stops, or Ctrl-C
async fn wait_for_delivered(handle: &ConsumerHandle, count: u64) -> Result<bool> {
    let drained = async {
        loop {
            let stats = handle.stats();
            if stats.delivered + stats.duplicates_skipped >= count || handle.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::select! {
        _ = drained => Ok(true),
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            Ok(false)
        }
    }
}

fn print_stats(stats: &ConsumerStats) {
    println!(
        "  delivered {}, committed {}, failed {}, dead-lettered {}, duplicates {}",
        stats.delivered, stats.commits, stats.failed, stats.dead_lettered, stats.duplicates_skipped
    );
    match stats.held_at {
        Some(held) => println!("  checkpoint held at {} after a failure", held),
        None => println!("  checkpoint at {}", stats.last_committed),
    }
}

pub async fn execute(
    ledger_path: PathBuf,
    name: String,
    messages: u64,
    fail_at: Option<u64>,
    dead_letter: bool,
) -> Result<()> {
    let checkpoints = Checkpoints::open(&ledger_path).context("Failed to open ledger")?;
    let log = Arc::new(MemoryStreamStore::default());
    let source = Arc::new(ResubscribingSource::new(
        log.clone(),
        ReconnectConfig::default(),
    ));

    // The log is fresh on every run, so a checkpoint left by an earlier run
    // would point past its end
    checkpoints
        .ledger()
        .reset(&name, Position::START)
        .await
        .context("Failed to reset checkpoint")?;

    let backlog = messages / 2;
    for seq in 1..=backlog {
        publish(&log, seq)?;
    }
    println!("Published {} historical message(s)", backlog);

    let policy = if dead_letter {
        FailurePolicy::DeadLetter
    } else {
        FailurePolicy::LogAndContinue
    };
    let config = ConsumerConfig::new(name.clone()).with_failure_policy(policy);

    println!("\nRun 1 (Ctrl-C to stop)");
    let handle = checkpoints
        .consumer(source.clone(), config.clone())
        .start_exclusive(printing_handler(fail_at.map(Position::new)))
        .await
        .context("Failed to start consumer")?;

    let state = handle.wait_for_state(ConsumerState::Live).await;
    println!("  -- {} after {} --", state, handle.committed());

    let mut interrupted = false;
    for seq in backlog + 1..=messages {
        tokio::select! {
            _ = tokio::time::sleep(PUBLISH_INTERVAL) => publish(&log, seq)?,
            _ = tokio::signal::ctrl_c() => {
                interrupted = true;
                break;
            }
        }
    }
    if !interrupted {
        interrupted = !wait_for_delivered(&handle, messages).await?;
    }

    let stats = handle.stop().await.context("Consumer failed")?;
    print_stats(&stats);
    if interrupted {
        println!("\nInterrupted");
        return Ok(());
    }

    let resume_from = checkpoints
        .position(&name)
        .await
        .context("Failed to read checkpoint")?
        .unwrap_or(Position::START);
    if resume_from.as_u64() >= messages {
        println!("\n✓ All {} message(s) committed", messages);
        return Ok(());
    }

    println!("\nRun 2: restart resumes after {}", resume_from);
    let handle = checkpoints
        .consumer(source, config)
        .start_exclusive(printing_handler(None))
        .await
        .context("Failed to restart consumer")?;
    let remaining = messages - resume_from.as_u64();
    wait_for_delivered(&handle, remaining).await?;
    let stats = handle.stop().await.context("Consumer failed")?;
    print_stats(&stats);

    let dead_letters = checkpoints.dead_letters().count().await?;
    if dead_letters > 0 {
        println!("\n{} message(s) parked; run 'waypoint dead-letters'", dead_letters);
    }

    Ok(())
}
