//! CLI subcommands

pub mod conflicts;
pub mod status;
pub mod sync;

use std::sync::Arc;

use anyhow::{Context, Result};

use davdrive_core::ports::IJournal;
use davdrive_dav::{DavClient, DavCredentials};
use davdrive_engine::LocalFileSystem;
use davdrive_journal::SqliteJournal;

use crate::config::Config;

/// Opens the journal configured for the folder.
pub(crate) async fn open_journal(config: &Config) -> Result<Arc<dyn IJournal>> {
    let journal = SqliteJournal::open(&config.journal_path())
        .await
        .context("failed to open sync journal")?;
    Ok(Arc::new(journal))
}

/// Builds the DAV client for the configured account.
pub(crate) fn dav_client(config: &Config) -> Result<Arc<DavClient>> {
    let client = DavClient::new(
        &config.account.server_url,
        DavCredentials {
            user: config.account.username.clone(),
            secret: config.account.password.clone(),
        },
        config.sync.http_timeout(),
    )
    .context("failed to construct DAV client")?;
    Ok(Arc::new(client))
}

/// Builds the local filesystem adapter for the configured folder.
pub(crate) fn local_fs(config: &Config) -> Arc<LocalFileSystem> {
    Arc::new(LocalFileSystem::new(&config.folder.local_path))
}
