//! Journal port (driven/secondary port)
//!
//! The journal is the only shared mutable state of a sync run: the
//! last-synced record per path, conflict bookkeeping, resumable upload
//! state, selective-sync lists and the error blacklist.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific and
//!   don't need domain-level classification.
//! - Writes are serialized by the implementation (one transaction per
//!   record write); reads may be concurrent.

use crate::domain::newtypes::SyncPath;
use crate::domain::records::{
    BlacklistEntry, ConflictRecord, FileRecord, SelectiveSyncKind, UploadInfo,
};

/// Port trait for the persistent per-folder journal
#[async_trait::async_trait]
pub trait IJournal: Send + Sync {
    // --- File records ---

    async fn get_file_record(&self, path: &SyncPath) -> anyhow::Result<Option<FileRecord>>;

    /// Inserts or replaces a record, keyed by path.
    async fn set_file_record(&self, record: &FileRecord) -> anyhow::Result<()>;

    async fn delete_file_record(&self, path: &SyncPath) -> anyhow::Result<()>;

    /// Deletes the record at `prefix` and every record below it.
    async fn delete_subtree(&self, prefix: &SyncPath) -> anyhow::Result<()>;

    /// All records at or below `prefix`, ordered by path.
    async fn get_files_below(&self, prefix: &SyncPath) -> anyhow::Result<Vec<FileRecord>>;

    /// Re-keys a subtree after a rename, preserving record contents.
    async fn rename_subtree(&self, old: &SyncPath, new: &SyncPath) -> anyhow::Result<()>;

    // --- Remote rediscovery ---

    /// Marks `path` and all its ancestors with the invalid etag so the next
    /// run re-reads them from the server.
    async fn schedule_path_for_remote_discovery(&self, path: &SyncPath) -> anyhow::Result<()>;

    /// Invalidates every directory etag in the journal.
    async fn force_remote_discovery_next_sync(&self) -> anyhow::Result<()>;

    // --- Selective sync ---

    /// Replaces a selective-sync list. Setting the black list also
    /// schedules the listed paths for remote rediscovery.
    async fn set_selective_sync_list(
        &self,
        kind: SelectiveSyncKind,
        paths: &[SyncPath],
    ) -> anyhow::Result<()>;

    async fn get_selective_sync_list(
        &self,
        kind: SelectiveSyncKind,
    ) -> anyhow::Result<Vec<SyncPath>>;

    // --- Upload resumption ---

    async fn get_upload_info(&self, path: &SyncPath) -> anyhow::Result<Option<UploadInfo>>;

    async fn set_upload_info(&self, path: &SyncPath, info: &UploadInfo) -> anyhow::Result<()>;

    async fn clear_upload_info(&self, path: &SyncPath) -> anyhow::Result<()>;

    // --- Conflicts ---

    async fn set_conflict_record(&self, record: &ConflictRecord) -> anyhow::Result<()>;

    async fn get_conflict_record(&self, path: &SyncPath)
        -> anyhow::Result<Option<ConflictRecord>>;

    /// Paths of all recorded conflict copies.
    async fn conflict_record_paths(&self) -> anyhow::Result<Vec<SyncPath>>;

    async fn delete_conflict_record(&self, path: &SyncPath) -> anyhow::Result<()>;

    // --- Error blacklist ---

    async fn blacklist_entry(&self, path: &SyncPath) -> anyhow::Result<Option<BlacklistEntry>>;

    async fn set_blacklist_entry(&self, entry: &BlacklistEntry) -> anyhow::Result<()>;

    async fn delete_blacklist_entry(&self, path: &SyncPath) -> anyhow::Result<()>;

    /// Clears transient entries; permanent ones survive.
    async fn wipe_error_blacklist(&self) -> anyhow::Result<()>;
}
