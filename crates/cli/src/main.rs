//! # Hive CLI
//!
//! Operator tooling for a Hive runtime directory (`.hive` by default):
//! inspect unprocessed bus messages and persisted state machines, edit the
//! store, and manage the configuration file.
//!
//! ## Commands
//!
//! - `hive status` - Store backend and record counts
//! - `hive pending` - Messages that will be replayed on next start
//! - `hive machines` - Last persisted state of every machine
//! - `hive store get|set|keys|delete|clear|namespaces` - Key-value access
//! - `hive purge` - Remove expired entries now
//! - `hive config show|init` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hive_core::config::HiveConfig;
use hive_core::store::Store;
use std::io;
use std::path::PathBuf;

mod commands;

use commands::{ConfigCommand, StoreCommand};

/// Hive - inspect and maintain the agent coordination runtime
#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Runtime directory (overrides HIVE_RUNTIME_PATH)
    #[arg(long, global = true, value_name = "DIR")]
    runtime: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "HIVE_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the store backend and record counts
    Status,

    /// List unprocessed bus messages in replay order
    Pending {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List persisted state machine snapshots
    Machines {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Read and edit the key-value store
    Store {
        #[command(subcommand)]
        command: StoreCommand,
    },

    /// Remove expired store entries
    Purge,

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    if let Some(runtime) = &cli.runtime {
        std::env::set_var("HIVE_RUNTIME_PATH", runtime);
    }

    let config = HiveConfig::load().await;
    let mut out = io::stdout().lock();

    match cli.command {
        Commands::Config { command } => commands::config(&config, command, &mut out).await,
        Commands::Status => commands::status(&Store::open(&config.store), &mut out),
        Commands::Pending { json } => commands::pending(&Store::open(&config.store), json, &mut out),
        Commands::Machines { json } => {
            commands::machines(&Store::open(&config.store), json, &mut out)
        }
        Commands::Store { command } => {
            commands::store(&Store::open(&config.store), command, &mut out)
        }
        Commands::Purge => commands::purge(&Store::open(&config.store), &mut out),
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();

    Ok(())
}
