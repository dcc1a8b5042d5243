//! Local filesystem port (driven/secondary port)
//!
//! All local I/O goes through this trait so the engine can be exercised
//! against a temp directory in tests and so placeholder-aware adapters can
//! intercept reads.
//!
//! Paths are [`SyncPath`]s relative to the synchronized folder root; the
//! adapter owns the mapping to absolute paths.

use crate::domain::checksum::{Checksum, ChecksumAlgorithm};
use crate::domain::newtypes::SyncPath;
use crate::domain::records::FileType;

/// Hydration state of a local entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlaceholderState {
    /// Not managed by a placeholder provider.
    #[default]
    None,
    /// Placeholder whose content is present on disk.
    Hydrated,
    /// Placeholder advertising size and modtime without on-disk bytes.
    Dehydrated,
}

/// One directory entry as seen by local enumeration
#[derive(Debug, Clone, PartialEq)]
pub struct LocalEntry {
    pub name: String,
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub modtime: i64,
    pub file_type: FileType,
    pub placeholder: PlaceholderState,
    /// Unix permission bits.
    pub mode: u32,
    /// Inode number; 0 when unavailable.
    pub inode: u64,
    pub is_hidden: bool,
    pub is_symlink: bool,
}

/// Port trait for local file operations
///
/// ## Implementation Notes
///
/// - `compute_checksum` must stream; files may be large.
/// - For a dehydrated placeholder the adapter must not hydrate just to
///   compute a checksum; callers use the journal's stored checksum instead.
/// - `write_atomic` writes to a temporary sibling, fsyncs and renames into
///   place, then applies the modtime.
#[async_trait::async_trait]
pub trait ILocalFileSystem: Send + Sync {
    /// Lists the direct children of `dir`.
    async fn enumerate(&self, dir: &SyncPath) -> anyhow::Result<Vec<LocalEntry>>;

    /// Stats a single path; `None` when it does not exist.
    async fn metadata(&self, path: &SyncPath) -> anyhow::Result<Option<LocalEntry>>;

    /// Streaming checksum of a file's content.
    async fn compute_checksum(
        &self,
        path: &SyncPath,
        algo: ChecksumAlgorithm,
    ) -> anyhow::Result<Checksum>;

    /// Reads a whole file.
    async fn read(&self, path: &SyncPath) -> anyhow::Result<Vec<u8>>;

    /// Atomically replaces `path` with `data` and stamps `modtime`.
    async fn write_atomic(&self, path: &SyncPath, data: &[u8], modtime: i64)
        -> anyhow::Result<()>;

    async fn rename(&self, src: &SyncPath, dst: &SyncPath) -> anyhow::Result<()>;

    /// Copies a file preserving its permission bits.
    async fn copy(&self, src: &SyncPath, dst: &SyncPath) -> anyhow::Result<()>;

    async fn remove(&self, path: &SyncPath, recursive: bool) -> anyhow::Result<()>;

    async fn mkdir(&self, path: &SyncPath) -> anyhow::Result<()>;

    async fn set_modtime(&self, path: &SyncPath, modtime: i64) -> anyhow::Result<()>;

    async fn set_permissions(&self, path: &SyncPath, mode: u32) -> anyhow::Result<()>;
}
