//! Engine configuration
//!
//! [`SyncOptions`] carries the per-engine tunables; there is no global
//! state, each engine instance owns its own copy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Virtual-file mode for the synchronized folder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VfsMode {
    /// All files are fully materialized on disk.
    #[default]
    Off,
    /// Dehydrated files are marked with a filename suffix.
    WithSuffix,
    /// Placeholders are managed by an OS-level provider.
    PlatformPlaceholder,
}

/// Tunables for a single sync engine instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// First chunk size for chunked uploads; files larger than this are
    /// uploaded through the chunking namespace.
    pub initial_chunk_size: u64,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    /// Maximum network jobs in flight; 0 forces serial execution.
    pub parallel_network_jobs: u32,
    /// Deadline applied to every HTTP request, in seconds.
    pub http_timeout_secs: u64,
    pub ignore_hidden_files: bool,
    pub vfs_mode: VfsMode,
    /// Whether newly discovered remote files start as dehydrated
    /// placeholders instead of being downloaded.
    pub files_are_dehydrated: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            initial_chunk_size: 10 * 1024 * 1024,
            min_chunk_size: 1024 * 1024,
            max_chunk_size: 100 * 1024 * 1024,
            parallel_network_jobs: 6,
            http_timeout_secs: 30,
            ignore_hidden_files: false,
            vfs_mode: VfsMode::Off,
            files_are_dehydrated: false,
        }
    }
}

impl SyncOptions {
    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Clamps a proposed chunk size into the configured window.
    #[must_use]
    pub fn clamp_chunk_size(&self, size: u64) -> u64 {
        size.clamp(self.min_chunk_size, self.max_chunk_size)
    }
}
