//! Remote storage port (driven/secondary port)
//!
//! The interface the engine uses against the WebDAV-style remote. The
//! primary implementation talks HTTP in `davdrive-dav`; tests use an
//! in-memory fake.
//!
//! ## Design Notes
//!
//! - Methods return a structured [`RemoteError`] rather than `anyhow`
//!   because discovery and propagation need to classify failures (soft
//!   subtree error vs. fatal run error vs. quota) per status code.
//! - [`RemoteEntry`] is a port-level DTO; discovery maps it onto sync
//!   items and journal records.

use thiserror::Error;

use crate::capabilities::Capabilities;
use crate::domain::checksum::Checksum;
use crate::domain::newtypes::{ETag, FileId, SyncPath};

/// PROPFIND depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    /// The resource itself only.
    Zero,
    /// The resource and its direct children.
    One,
}

impl Depth {
    #[must_use]
    pub fn header_value(&self) -> &'static str {
        match self {
            Depth::Zero => "0",
            Depth::One => "1",
        }
    }
}

/// One entry of a Multi-Status PROPFIND response
///
/// Identity properties are optional because a misbehaving server may omit
/// them; discovery turns a missing etag, file id or permission string into
/// an item-level error instead of failing the parse.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    /// Path relative to the synchronized folder root.
    pub path: SyncPath,
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub modtime: i64,
    pub etag: Option<ETag>,
    pub file_id: Option<FileId>,
    /// Server permission string (e.g. "RDNVCKW").
    pub permissions: Option<String>,
    /// Raw checksum header content (`ALGO:HEX`, possibly several entries).
    pub checksum_header: Option<String>,
    pub is_collection: bool,
}

impl RemoteEntry {
    #[must_use]
    pub fn name(&self) -> &str {
        self.path.file_name()
    }
}

/// Result of a GET
#[derive(Debug, Clone)]
pub struct RemoteDownload {
    pub data: Vec<u8>,
    pub etag: Option<ETag>,
    pub file_id: Option<FileId>,
    /// `OC-Checksum` header, verified before the file is moved into place.
    pub checksum_header: Option<String>,
    /// `Content-MD5` header, the fallback integrity check.
    pub content_md5: Option<String>,
    /// `X-OC-Mtime` / Last-Modified, seconds since the epoch.
    pub modtime: Option<i64>,
}

/// Identity returned by a PUT, MKCOL or finalize MOVE
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutOutcome {
    pub etag: Option<ETag>,
    pub file_id: Option<FileId>,
}

/// Classified remote failures
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// 401; fatal for the whole run.
    #[error("authentication failed")]
    AuthFailed,

    /// Any other HTTP error status.
    #[error("server replied {code}: {message}")]
    Http { code: u16, message: String },

    /// Malformed or truncated Multi-Status body.
    /// Display mirrors the transport layer's opaque parse-failure message.
    #[error("Unknown error")]
    InvalidXml,

    /// The configured deadline elapsed.
    /// Display mirrors the transport layer's cancellation message.
    #[error("Operation canceled")]
    Timeout,

    /// The server violated the protocol (e.g. 200 where 207 is required).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport-level failure (DNS, connection reset, TLS).
    #[error("network error: {0}")]
    Network(String),
}

impl RemoteError {
    /// Convenience constructor for plain status errors.
    #[must_use]
    pub fn http(code: u16) -> Self {
        RemoteError::Http {
            code,
            message: format!("HTTP {code}"),
        }
    }

    #[must_use]
    pub fn http_code(&self) -> Option<u16> {
        match self {
            RemoteError::Http { code, .. } => Some(*code),
            RemoteError::AuthFailed => Some(401),
            _ => None,
        }
    }

    /// Whether a PROPFIND failure on a non-root directory may be skipped
    /// while the rest of the run continues (403, 404, 5xx).
    #[must_use]
    pub fn is_soft_discovery_error(&self) -> bool {
        matches!(
            self,
            RemoteError::Http { code, .. } if *code == 403 || *code == 404 || *code >= 500
        )
    }

    /// 507 Insufficient Storage on an upload.
    #[must_use]
    pub fn is_insufficient_storage(&self) -> bool {
        self.http_code() == Some(507)
    }

    /// Transient failures that get blacklisted with backoff and retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Http { code, .. } => *code == 503 || *code == 429 || *code >= 500,
            RemoteError::Network(_) | RemoteError::Timeout => true,
            _ => false,
        }
    }
}

/// Port trait for the WebDAV-style remote storage
///
/// ## Implementation Notes
///
/// - Chunked uploads use a client-chosen numeric transfer id addressing a
///   server-side upload directory; chunks are PUT under zero-padded offset
///   names and the transfer is finalized by a MOVE of the assembled file.
/// - `put_simple` and `put_chunk` both carry the total upload length so
///   the server can reject over-quota transfers before the last chunk.
#[async_trait::async_trait]
pub trait IRemoteStorage: Send + Sync {
    /// Fetches and parses the server capabilities document.
    async fn capabilities(&self) -> Result<Capabilities, RemoteError>;

    /// Enumerates properties of `path` (and its children for depth 1).
    async fn propfind(&self, path: &SyncPath, depth: Depth)
        -> Result<Vec<RemoteEntry>, RemoteError>;

    /// Downloads file content with its integrity headers.
    async fn get(&self, path: &SyncPath) -> Result<RemoteDownload, RemoteError>;

    /// Single-request upload for small files.
    async fn put_simple(
        &self,
        path: &SyncPath,
        data: Vec<u8>,
        modtime: i64,
        checksum: Option<&Checksum>,
    ) -> Result<PutOutcome, RemoteError>;

    /// Creates a remote directory.
    async fn mkcol(&self, path: &SyncPath) -> Result<PutOutcome, RemoteError>;

    /// Moves or renames a resource.
    async fn move_item(
        &self,
        src: &SyncPath,
        dst: &SyncPath,
        overwrite: bool,
    ) -> Result<(), RemoteError>;

    /// Deletes a resource (recursively for collections).
    async fn delete(&self, path: &SyncPath) -> Result<(), RemoteError>;

    /// MKCOL of the upload-session directory for `transfer_id`.
    async fn create_upload_session(&self, transfer_id: u64) -> Result<(), RemoteError>;

    /// PUT of one chunk at `offset` within the session.
    async fn put_chunk(
        &self,
        transfer_id: u64,
        offset: u64,
        data: Vec<u8>,
        total_size: u64,
    ) -> Result<(), RemoteError>;

    /// MOVE of the assembled session file onto its destination.
    async fn finalize_upload(
        &self,
        transfer_id: u64,
        dst: &SyncPath,
        total_length: u64,
        modtime: i64,
        checksum: Option<&Checksum>,
    ) -> Result<PutOutcome, RemoteError>;
}
