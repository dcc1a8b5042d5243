//! `davdrive sync` - run one synchronization pass

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use tracing::info;

use davdrive_core::domain::{Instruction, ItemStatus};
use davdrive_engine::{NoopPlaceholders, SyncEngine, SyncEvent};

use crate::config::Config;

#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Print every item, not only failures
    #[arg(long)]
    show_all: bool,
}

impl SyncCommand {
    pub async fn execute(&self, config: &Config) -> Result<()> {
        let remote = super::dav_client(config)?;
        let fs = super::local_fs(config);
        let journal = super::open_journal(config).await?;

        let mut engine = SyncEngine::new(
            remote,
            fs,
            journal,
            Arc::new(NoopPlaceholders),
            config.sync.clone(),
        );
        let mut events = engine.subscribe();

        let show_all = self.show_all;
        let printer = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SyncEvent::AboutToPropagate(items) => {
                        info!(items = items.len(), "propagating");
                    }
                    SyncEvent::ItemCompleted(item) => {
                        let failed = !item.status.is_benign();
                        if show_all || failed {
                            let verb = match item.instruction {
                                Instruction::New | Instruction::Sync => "transfer",
                                Instruction::Remove => "remove",
                                Instruction::Rename => "rename",
                                Instruction::Conflict => "conflict",
                                _ => "update",
                            };
                            if failed {
                                eprintln!(
                                    "FAIL {verb} {}: {}",
                                    item.path,
                                    item.error_string.as_deref().unwrap_or("unknown error")
                                );
                            } else {
                                println!("ok   {verb} {}", item.path);
                            }
                        }
                    }
                    SyncEvent::SyncError { message, .. } => {
                        eprintln!("sync error: {message}");
                    }
                    SyncEvent::Finished { .. } => break,
                }
            }
        });

        let result = engine.sync().await?;
        printer.await.ok();

        let failures = result
            .items
            .iter()
            .filter(|i| !i.status.is_benign())
            .count();
        let transferred = result
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Success && i.instruction.is_data_transfer())
            .count();
        println!(
            "sync {}: {} transferred, {} failed, {} total",
            if result.success { "finished" } else { "FAILED" },
            transferred,
            failures,
            result.items.len()
        );

        if result.success {
            Ok(())
        } else {
            anyhow::bail!(
                "synchronization failed{}",
                result
                    .error
                    .map(|e| format!(": {e}"))
                    .unwrap_or_default()
            )
        }
    }
}
