//! Journal row types
//!
//! These are the durable records the journal persists between runs: the
//! last-synced state per path, conflict bookkeeping, resumable upload state,
//! selective-sync lists and the error blacklist.

use serde::{Deserialize, Serialize};

use super::checksum::Checksum;
use super::newtypes::{ETag, FileId, SyncPath};

/// Kind of filesystem entry a record describes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    #[default]
    File,
    Directory,
    /// A dehydrated placeholder: size and modtime are known, bytes are not
    /// present on disk.
    Virtual,
}

impl FileType {
    #[must_use]
    pub fn is_directory(&self) -> bool {
        matches!(self, FileType::Directory)
    }
}

/// The journal's view of one synchronized path
///
/// A record reflects the state after the last successful propagation of the
/// path: local metadata (inode, modtime, size, permission bits) alongside
/// the remote identity (file id, etag, remote permission string) and the
/// content checksum used for change suppression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: SyncPath,
    /// Advisory local inode, used as a hint for local move detection.
    pub inode: u64,
    /// Local modification time, seconds since the epoch.
    pub modtime: i64,
    pub size: u64,
    pub file_id: FileId,
    pub etag: ETag,
    pub checksum: Option<Checksum>,
    pub file_type: FileType,
    /// Local permission bits (Unix mode).
    pub perm: u32,
    /// Server permission string (e.g. "RDNVCKW").
    pub remote_perm: String,
}

impl FileRecord {
    /// Marks the record as needing remote rediscovery.
    pub fn invalidate_etag(&mut self) {
        self.etag = ETag::invalid();
    }
}

/// Bookkeeping for a conflict copy left next to the original file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Path of the conflict copy.
    pub path: SyncPath,
    /// Path the conflict copy was set aside from.
    pub base_path: SyncPath,
    pub base_file_id: Option<FileId>,
    pub base_etag: Option<ETag>,
    pub base_modtime: i64,
}

/// Resumable chunked-upload state for one path
///
/// An `UploadInfo` survives run failures and aborts so a later run can
/// continue the transfer. It is discarded when the stored file metadata no
/// longer matches the file on disk, or when the server's reset-code list
/// tells us the session is unrecoverable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadInfo {
    /// Client-chosen transfer identifier; 0 when invalid.
    pub transfer_id: u64,
    /// Next chunk offset to send.
    pub chunk_offset: u64,
    pub chunk_size: u64,
    /// Modtime of the file when the transfer started.
    pub modtime: i64,
    /// Size of the file when the transfer started.
    pub size: u64,
    pub error_count: u32,
    pub valid: bool,
}

impl UploadInfo {
    /// True when the stored session still matches the file on disk.
    #[must_use]
    pub fn still_matches(&self, modtime: i64, size: u64) -> bool {
        self.valid && self.modtime == modtime && self.size == size
    }
}

/// Which selective-sync list a set of paths belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectiveSyncKind {
    /// Paths excluded from synchronization.
    BlackList,
    /// Paths explicitly selected while their parent is undecided.
    WhiteList,
    /// Remote folders the user has been asked about already.
    AllowedRemote,
}

impl SelectiveSyncKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectiveSyncKind::BlackList => "blacklist",
            SelectiveSyncKind::WhiteList => "whitelist",
            SelectiveSyncKind::AllowedRemote => "allowed_remote",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blacklist" => Some(SelectiveSyncKind::BlackList),
            "whitelist" => Some(SelectiveSyncKind::WhiteList),
            "allowed_remote" => Some(SelectiveSyncKind::AllowedRemote),
            _ => None,
        }
    }
}

/// How long an error should keep a path out of propagation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlacklistCategory {
    /// Retried with backoff; wiped by `wipe_error_blacklist`.
    #[default]
    Transient,
    /// Kept until the file changes; survives a blacklist wipe.
    Permanent,
}

/// One error-blacklist row
///
/// Blacklisted paths are skipped without network traffic until their ignore
/// window elapses; each retry doubles the window up to a cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub path: SyncPath,
    pub error_string: String,
    pub category: BlacklistCategory,
    pub retry_count: u32,
    /// Unix seconds of the last attempt.
    pub last_try: i64,
    /// Seconds the path stays ignored after `last_try`.
    pub ignore_duration: i64,
}

impl BlacklistEntry {
    /// Base ignore window for the first failure.
    pub const BASE_IGNORE_SECS: i64 = 25;
    /// Upper bound for the backoff window (24h).
    pub const MAX_IGNORE_SECS: i64 = 24 * 60 * 60;

    /// Creates a first-failure entry.
    pub fn new(
        path: SyncPath,
        error_string: impl Into<String>,
        category: BlacklistCategory,
        now: i64,
    ) -> Self {
        Self {
            path,
            error_string: error_string.into(),
            category,
            retry_count: 1,
            last_try: now,
            ignore_duration: Self::BASE_IGNORE_SECS,
        }
    }

    /// True while the path should be skipped without a new attempt.
    #[must_use]
    pub fn is_active(&self, now: i64) -> bool {
        now < self.last_try + self.ignore_duration
    }

    /// Records another failed attempt, doubling the ignore window.
    pub fn record_failure(&mut self, error_string: impl Into<String>, now: i64) {
        self.retry_count += 1;
        self.error_string = error_string.into();
        self.last_try = now;
        self.ignore_duration = (self.ignore_duration * 2).min(Self::MAX_IGNORE_SECS);
    }
}
