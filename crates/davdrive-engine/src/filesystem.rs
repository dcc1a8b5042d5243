//! Local filesystem adapter
//!
//! Maps `SyncPath`s onto a root directory and implements enumeration,
//! streaming checksums and the mutation primitives the propagator needs.
//! Checksums run on the blocking pool; everything else goes through
//! `tokio::fs`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use filetime::FileTime;
use sha1::Digest;
use tracing::warn;

use davdrive_core::domain::checksum::{Checksum, ChecksumAlgorithm};
use davdrive_core::domain::newtypes::SyncPath;
use davdrive_core::domain::records::FileType;
use davdrive_core::ports::{ILocalFileSystem, IPlaceholderProvider, LocalEntry, PlaceholderState};

use crate::vfs::NoopPlaceholders;

/// Read buffer for streaming checksum computation.
const HASH_BUF_SIZE: usize = 64 * 1024;

/// Suffix of in-progress download temporaries, excluded from enumeration.
const TEMP_SUFFIX: &str = ".davdrivetmp";

/// Filesystem adapter rooted at the synchronized folder
pub struct LocalFileSystem {
    root: PathBuf,
    placeholders: Arc<dyn IPlaceholderProvider>,
}

impl LocalFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            placeholders: Arc::new(NoopPlaceholders),
        }
    }

    pub fn with_placeholders(
        root: impl Into<PathBuf>,
        placeholders: Arc<dyn IPlaceholderProvider>,
    ) -> Self {
        Self {
            root: root.into(),
            placeholders,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn abs(&self, path: &SyncPath) -> PathBuf {
        if path.is_root() {
            self.root.clone()
        } else {
            self.root.join(path.as_str())
        }
    }

    async fn entry_from_metadata(
        &self,
        path: &SyncPath,
        name: String,
        metadata: &std::fs::Metadata,
    ) -> LocalEntry {
        let file_type = if metadata.is_dir() {
            FileType::Directory
        } else {
            FileType::File
        };
        let modtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        #[cfg(unix)]
        let (mode, inode) = {
            use std::os::unix::fs::MetadataExt;
            (metadata.mode() & 0o7777, metadata.ino())
        };
        #[cfg(not(unix))]
        let (mode, inode) = (0o644u32, 0u64);

        let placeholder = if metadata.is_file() && self.placeholders.is_placeholder(path).await {
            PlaceholderState::Dehydrated
        } else {
            PlaceholderState::None
        };

        LocalEntry {
            is_hidden: name.starts_with('.'),
            name,
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modtime,
            file_type,
            placeholder,
            mode,
            inode,
            is_symlink: metadata.is_symlink(),
        }
    }
}

/// Digests an in-memory buffer; used to verify downloads before any byte
/// reaches its final location.
pub fn digest_bytes(data: &[u8], algo: ChecksumAlgorithm) -> Checksum {
    let hex = match algo {
        ChecksumAlgorithm::Sha1 => hex::encode(sha1::Sha1::digest(data)),
        ChecksumAlgorithm::Sha256 => hex::encode(sha2::Sha256::digest(data)),
        ChecksumAlgorithm::Sha3_256 => hex::encode(sha3::Sha3_256::digest(data)),
        ChecksumAlgorithm::Md5 => hex::encode(md5::Md5::digest(data)),
        ChecksumAlgorithm::Adler32 => {
            format!("{:x}", adler32::RollingAdler32::from_buffer(data).hash())
        }
    };
    Checksum::new(algo, hex)
}

/// Streams a file through the requested digest.
fn digest_file(path: &Path, algo: ChecksumAlgorithm) -> Result<Checksum> {
    use std::io::Read;

    fn run<D: Digest + Default>(file: &mut std::fs::File) -> Result<String> {
        let mut hasher = D::default();
        let mut buf = [0u8; HASH_BUF_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {} for checksum", path.display()))?;

    let hex = match algo {
        ChecksumAlgorithm::Sha1 => run::<sha1::Sha1>(&mut file)?,
        ChecksumAlgorithm::Sha256 => run::<sha2::Sha256>(&mut file)?,
        ChecksumAlgorithm::Sha3_256 => run::<sha3::Sha3_256>(&mut file)?,
        ChecksumAlgorithm::Md5 => run::<md5::Md5>(&mut file)?,
        ChecksumAlgorithm::Adler32 => {
            let mut hasher = adler32::RollingAdler32::new();
            let mut buf = [0u8; HASH_BUF_SIZE];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update_buffer(&buf[..n]);
            }
            format!("{:x}", hasher.hash())
        }
    };

    Ok(Checksum::new(algo, hex))
}

#[async_trait::async_trait]
impl ILocalFileSystem for LocalFileSystem {
    async fn enumerate(&self, dir: &SyncPath) -> Result<Vec<LocalEntry>> {
        let abs = self.abs(dir);
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&abs)
            .await
            .with_context(|| format!("failed to read directory {}", abs.display()))?;

        while let Some(entry) = reader.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                warn!(path = %abs.display(), "skipping entry with non-UTF-8 name");
                continue;
            };
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            let Ok(child) = dir.join(&name) else {
                continue;
            };
            let metadata = tokio::fs::symlink_metadata(entry.path()).await?;
            entries.push(self.entry_from_metadata(&child, name, &metadata).await);
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn metadata(&self, path: &SyncPath) -> Result<Option<LocalEntry>> {
        let abs = self.abs(path);
        match tokio::fs::symlink_metadata(&abs).await {
            Ok(metadata) => {
                let name = path.file_name().to_string();
                Ok(Some(self.entry_from_metadata(path, name, &metadata).await))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to stat {}", abs.display())),
        }
    }

    async fn compute_checksum(
        &self,
        path: &SyncPath,
        algo: ChecksumAlgorithm,
    ) -> Result<Checksum> {
        let abs = self.abs(path);
        tokio::task::spawn_blocking(move || digest_file(&abs, algo))
            .await
            .context("checksum task panicked")?
    }

    async fn read(&self, path: &SyncPath) -> Result<Vec<u8>> {
        let abs = self.abs(path);
        tokio::fs::read(&abs)
            .await
            .with_context(|| format!("failed to read {}", abs.display()))
    }

    async fn write_atomic(&self, path: &SyncPath, data: &[u8], modtime: i64) -> Result<()> {
        let abs = self.abs(path);
        let parent = abs
            .parent()
            .with_context(|| format!("{} has no parent", abs.display()))?;
        let tmp = parent.join(format!(
            ".{}{}",
            path.file_name(),
            TEMP_SUFFIX
        ));

        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("failed to write temporary {}", tmp.display()))?;
        let file = tokio::fs::File::open(&tmp).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &abs)
            .await
            .with_context(|| format!("failed to move {} into place", tmp.display()))?;

        filetime::set_file_mtime(&abs, FileTime::from_unix_time(modtime, 0))
            .with_context(|| format!("failed to set modtime on {}", abs.display()))?;
        Ok(())
    }

    async fn rename(&self, src: &SyncPath, dst: &SyncPath) -> Result<()> {
        let from = self.abs(src);
        let to = self.abs(dst);
        tokio::fs::rename(&from, &to)
            .await
            .with_context(|| format!("failed to rename {} to {}", from.display(), to.display()))
    }

    async fn copy(&self, src: &SyncPath, dst: &SyncPath) -> Result<()> {
        let from = self.abs(src);
        let to = self.abs(dst);
        tokio::fs::copy(&from, &to)
            .await
            .map(|_| ())
            .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))
    }

    async fn remove(&self, path: &SyncPath, recursive: bool) -> Result<()> {
        let abs = self.abs(path);
        let metadata = tokio::fs::symlink_metadata(&abs).await;
        match metadata {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to stat {}", abs.display())),
            Ok(m) if m.is_dir() && recursive => tokio::fs::remove_dir_all(&abs)
                .await
                .with_context(|| format!("failed to remove tree {}", abs.display())),
            Ok(m) if m.is_dir() => tokio::fs::remove_dir(&abs)
                .await
                .with_context(|| format!("failed to remove directory {}", abs.display())),
            Ok(_) => tokio::fs::remove_file(&abs)
                .await
                .with_context(|| format!("failed to remove {}", abs.display())),
        }
    }

    async fn mkdir(&self, path: &SyncPath) -> Result<()> {
        let abs = self.abs(path);
        tokio::fs::create_dir_all(&abs)
            .await
            .with_context(|| format!("failed to create directory {}", abs.display()))
    }

    async fn set_modtime(&self, path: &SyncPath, modtime: i64) -> Result<()> {
        let abs = self.abs(path);
        filetime::set_file_mtime(&abs, FileTime::from_unix_time(modtime, 0))
            .with_context(|| format!("failed to set modtime on {}", abs.display()))
    }

    async fn set_permissions(&self, path: &SyncPath, mode: u32) -> Result<()> {
        let abs = self.abs(path);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&abs, std::fs::Permissions::from_mode(mode))
                .await
                .with_context(|| format!("failed to set permissions on {}", abs.display()))?;
        }
        #[cfg(not(unix))]
        {
            let _ = (abs, mode);
        }
        Ok(())
    }
}
