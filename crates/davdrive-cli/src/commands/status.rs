//! `davdrive status` - summarize the journal

use anyhow::Result;
use clap::Args;

use davdrive_core::domain::{FileType, SyncPath};
use davdrive_core::ports::IJournal;

use crate::config::Config;

#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Only report entries below this folder-relative path
    #[arg(long)]
    path: Option<String>,
}

impl StatusCommand {
    pub async fn execute(&self, config: &Config) -> Result<()> {
        let journal = super::open_journal(config).await?;

        let prefix = match &self.path {
            Some(p) => SyncPath::new(p.as_str())?,
            None => SyncPath::root(),
        };
        let records = journal.get_files_below(&prefix).await?;

        let files = records
            .iter()
            .filter(|r| r.file_type == FileType::File)
            .count();
        let dirs = records
            .iter()
            .filter(|r| r.file_type == FileType::Directory)
            .count();
        let virtuals = records
            .iter()
            .filter(|r| r.file_type == FileType::Virtual)
            .count();
        let bytes: u64 = records.iter().map(|r| r.size).sum();
        let pending_rediscovery = records
            .iter()
            .filter(|r| r.file_type == FileType::Directory && r.etag.is_invalid())
            .count();

        println!("folder:   {}", config.folder.local_path.display());
        println!("tracked:  {files} files, {dirs} directories ({bytes} bytes)");
        if virtuals > 0 {
            println!("virtual:  {virtuals} dehydrated placeholders");
        }
        if pending_rediscovery > 0 {
            println!("pending:  {pending_rediscovery} directories awaiting rediscovery");
        }

        let conflicts = journal.conflict_record_paths().await?;
        if conflicts.is_empty() {
            println!("conflicts: none");
        } else {
            println!("conflicts: {} (see `davdrive conflicts`)", conflicts.len());
        }

        Ok(())
    }
}
