//! Placeholder providers
//!
//! `Vfs::Off` installs [`NoopPlaceholders`]: every file is fully
//! materialized. [`SuffixPlaceholders`] implements the suffix scheme where
//! a dehydrated file lives under `<name>.davdrive` as a sparse file that
//! advertises size and modtime without occupying disk space. Platform
//! placeholder providers plug in through the same port from outside the
//! core.

use std::path::PathBuf;

use anyhow::{Context, Result};
use filetime::FileTime;

use davdrive_core::domain::newtypes::SyncPath;
use davdrive_core::ports::IPlaceholderProvider;

/// Suffix marking dehydrated placeholder files.
pub const PLACEHOLDER_SUFFIX: &str = ".davdrive";

/// Provider for `Vfs::Off`: nothing is ever a placeholder
pub struct NoopPlaceholders;

#[async_trait::async_trait]
impl IPlaceholderProvider for NoopPlaceholders {
    async fn create_placeholder(&self, _path: &SyncPath, _size: u64, _modtime: i64) -> Result<()> {
        anyhow::bail!("placeholders are disabled")
    }

    async fn hydrate(&self, _path: &SyncPath) -> Result<()> {
        Ok(())
    }

    async fn dehydrate(&self, _path: &SyncPath) -> Result<()> {
        anyhow::bail!("placeholders are disabled")
    }

    async fn is_placeholder(&self, _path: &SyncPath) -> bool {
        false
    }
}

/// Suffix-based placeholder provider for `Vfs::WithSuffix`
pub struct SuffixPlaceholders {
    root: PathBuf,
}

impl SuffixPlaceholders {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn placeholder_path(&self, path: &SyncPath) -> PathBuf {
        self.root
            .join(format!("{}{}", path.as_str(), PLACEHOLDER_SUFFIX))
    }
}

#[async_trait::async_trait]
impl IPlaceholderProvider for SuffixPlaceholders {
    async fn create_placeholder(&self, path: &SyncPath, size: u64, modtime: i64) -> Result<()> {
        let abs = self.placeholder_path(path);
        let file = std::fs::File::create(&abs)
            .with_context(|| format!("failed to create placeholder {}", abs.display()))?;
        // A sparse file carries the advertised size with no data blocks.
        file.set_len(size)?;
        drop(file);
        filetime::set_file_mtime(&abs, FileTime::from_unix_time(modtime, 0))?;
        Ok(())
    }

    async fn hydrate(&self, path: &SyncPath) -> Result<()> {
        // Content materialization is driven by the engine's download path;
        // hydrating here only strips the suffix.
        let from = self.placeholder_path(path);
        let to = self.root.join(path.as_str());
        std::fs::rename(&from, &to)
            .with_context(|| format!("failed to hydrate {}", from.display()))?;
        Ok(())
    }

    async fn dehydrate(&self, path: &SyncPath) -> Result<()> {
        let from = self.root.join(path.as_str());
        let metadata = std::fs::metadata(&from)?;
        let size = metadata.len();
        let modtime = FileTime::from_last_modification_time(&metadata);
        std::fs::remove_file(&from)?;
        self.create_placeholder(path, size, modtime.unix_seconds())
            .await
    }

    async fn is_placeholder(&self, path: &SyncPath) -> bool {
        path.as_str().ends_with(PLACEHOLDER_SUFFIX)
            || self.placeholder_path(path).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> SyncPath {
        SyncPath::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_noop_provider() {
        let provider = NoopPlaceholders;
        assert!(!provider.is_placeholder(&path("f")).await);
        assert!(provider.hydrate(&path("f")).await.is_ok());
        assert!(provider.create_placeholder(&path("f"), 1, 0).await.is_err());
        assert!(provider.dehydrate(&path("f")).await.is_err());
    }

    #[tokio::test]
    async fn test_suffix_placeholder_advertises_size_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let provider = SuffixPlaceholders::new(dir.path());

        provider
            .create_placeholder(&path("doc.pdf"), 4096, 1_700_000_000)
            .await
            .unwrap();

        let abs = dir.path().join("doc.pdf.davdrive");
        let metadata = std::fs::metadata(&abs).unwrap();
        assert_eq!(metadata.len(), 4096);
        assert!(provider.is_placeholder(&path("doc.pdf")).await);
    }

    #[tokio::test]
    async fn test_dehydrate_then_hydrate_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let provider = SuffixPlaceholders::new(dir.path());
        std::fs::write(dir.path().join("f"), vec![0u8; 128]).unwrap();

        provider.dehydrate(&path("f")).await.unwrap();
        assert!(!dir.path().join("f").exists());
        assert_eq!(std::fs::metadata(dir.path().join("f.davdrive")).unwrap().len(), 128);

        provider.hydrate(&path("f")).await.unwrap();
        assert!(dir.path().join("f").exists());
    }
}
