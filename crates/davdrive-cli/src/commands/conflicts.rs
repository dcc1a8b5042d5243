//! `davdrive conflicts` - list recorded conflict copies

use anyhow::Result;
use clap::Args;

use davdrive_core::ports::IJournal;

use crate::config::Config;

#[derive(Debug, Args)]
pub struct ConflictsCommand {}

impl ConflictsCommand {
    pub async fn execute(&self, config: &Config) -> Result<()> {
        let journal = super::open_journal(config).await?;
        let paths = journal.conflict_record_paths().await?;

        if paths.is_empty() {
            println!("no conflicts recorded");
            return Ok(());
        }

        for path in paths {
            match journal.get_conflict_record(&path).await? {
                Some(record) => {
                    println!("{}", record.base_path);
                    println!("    conflict copy: {}", record.path);
                }
                None => println!("{path}"),
            }
        }
        Ok(())
    }
}
