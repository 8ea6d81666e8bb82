//! Waypoint CLI - inspect and maintain checkpoint ledgers

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the ledger database
    #[arg(short, long, env = "WAYPOINT_LEDGER", default_value = "./waypoint.db")]
    ledger: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every checkpoint and lease holder
    Status,

    /// Show one checkpoint
    Show {
        /// Checkpoint name
        name: String,
    },

    /// Overwrite a checkpoint; the owning consumer resumes after it on its next start
    Reset {
        /// Checkpoint name
        name: String,

        /// New position (0 replays the whole log)
        position: u64,
    },

    /// List dead-lettered messages, newest first
    DeadLetters {
        /// Maximum number of entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Only show dead letters of this checkpoint
        #[arg(short, long)]
        checkpoint: Option<String>,
    },

    /// Run a consumer over an in-memory log end to end
    Demo {
        /// Checkpoint name
        #[arg(short, long, default_value = "demo")]
        name: String,

        /// Number of messages to publish (half before start, half live)
        #[arg(short, long, default_value_t = 10)]
        messages: u64,

        /// Make the handler fail at this position during the first run
        #[arg(long)]
        fail_at: Option<u64>,

        /// Park failed messages in the dead-letter queue instead of holding the checkpoint
        #[arg(long)]
        dead_letter: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    // Execute command
    match cli.command {
        Commands::Status => {
            commands::status::execute(cli.ledger).await?;
        }
        Commands::Show { name } => {
            commands::status::show(cli.ledger, &name).await?;
        }
        Commands::Reset { name, position } => {
            commands::reset::execute(cli.ledger, &name, position).await?;
        }
        Commands::DeadLetters { limit, checkpoint } => {
            commands::dead_letters::execute(cli.ledger, limit, checkpoint).await?;
        }
        Commands::Demo {
            name,
            messages,
            fail_at,
            dead_letter,
        } => {
            commands::demo::execute(cli.ledger, name, messages, fail_at, dead_letter).await?;
        }
    }

    Ok(())
}
