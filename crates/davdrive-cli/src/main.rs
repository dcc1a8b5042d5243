//! davdrive CLI
//!
//! Provides commands for:
//! - Running a synchronization pass
//! - Viewing the journal's sync status
//! - Listing recorded conflicts

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{conflicts::ConflictsCommand, status::StatusCommand, sync::SyncCommand};

#[derive(Debug, Parser)]
#[command(name = "davdrive", version, about = "WebDAV folder synchronization")]
pub struct Cli {
    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Synchronize the local folder with the server
    Sync(SyncCommand),
    /// Show what the journal knows about the folder
    Status(StatusCommand),
    /// List unresolved conflict copies
    Conflicts(ConflictsCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = config::Config::load_from(cli.config.as_deref())?;

    match cli.command {
        Commands::Sync(cmd) => cmd.execute(&config).await,
        Commands::Status(cmd) => cmd.execute(&config).await,
        Commands::Conflicts(cmd) => cmd.execute(&config).await,
    }
}
