//! Placeholder provider port (driven/secondary port)
//!
//! Virtual-file support is delegated to an OS- or suffix-specific provider.
//! With `VfsMode::Off` a no-op provider is installed and every entry is
//! treated as fully materialized.

use crate::domain::newtypes::SyncPath;

/// Port trait for dehydrated-placeholder management
#[async_trait::async_trait]
pub trait IPlaceholderProvider: Send + Sync {
    /// Creates a dehydrated placeholder advertising `size` and `modtime`.
    async fn create_placeholder(
        &self,
        path: &SyncPath,
        size: u64,
        modtime: i64,
    ) -> anyhow::Result<()>;

    /// Materializes the content of a placeholder.
    async fn hydrate(&self, path: &SyncPath) -> anyhow::Result<()>;

    /// Replaces a materialized file with a placeholder again.
    async fn dehydrate(&self, path: &SyncPath) -> anyhow::Result<()>;

    /// Whether `path` is currently a placeholder.
    async fn is_placeholder(&self, path: &SyncPath) -> bool;
}
