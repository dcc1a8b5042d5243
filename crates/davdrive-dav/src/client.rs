//! WebDAV HTTP client
//!
//! Wraps `reqwest::Client` with the endpoint layout of an OC-style DAV
//! server: a files namespace for the synchronized tree, an uploads
//! namespace for resumable chunked transfers, and a capabilities document.
//!
//! Every request carries the engine's configured deadline; failures are
//! mapped to the classified [`RemoteError`] the engine consumes.

use std::time::Duration;

use percent_encoding::percent_decode_str;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use url::Url;

use davdrive_core::capabilities::Capabilities;
use davdrive_core::domain::checksum::Checksum;
use davdrive_core::domain::newtypes::{ETag, FileId, SyncPath};
use davdrive_core::ports::{
    Depth, IRemoteStorage, PutOutcome, RemoteDownload, RemoteEntry, RemoteError,
};

use crate::propfind::{parse_multistatus, RawEntry, PROPFIND_BODY};

/// Opaque credentials handle for the DAV account
///
/// Obtaining and refreshing these is the account layer's business; the
/// client only attaches them to requests.
#[derive(Debug, Clone)]
pub struct DavCredentials {
    pub user: String,
    pub secret: String,
}

/// HTTP client for one DAV account's file tree
pub struct DavClient {
    http: Client,
    /// `.../remote.php/dav/files/<user>/`
    files_url: Url,
    /// `.../remote.php/dav/uploads/<user>/`
    uploads_url: Url,
    /// Capabilities JSON document.
    capabilities_url: Url,
    credentials: DavCredentials,
    timeout: Duration,
}

impl DavClient {
    /// Creates a client for `server_url` (e.g. `https://cloud.example.com`).
    pub fn new(
        server_url: &str,
        credentials: DavCredentials,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let base = Url::parse(server_url)
            .map_err(|e| RemoteError::Protocol(format!("invalid server url: {e}")))?;
        let files_url = base
            .join(&format!("remote.php/dav/files/{}/", credentials.user))
            .map_err(|e| RemoteError::Protocol(format!("invalid files url: {e}")))?;
        let uploads_url = base
            .join(&format!("remote.php/dav/uploads/{}/", credentials.user))
            .map_err(|e| RemoteError::Protocol(format!("invalid uploads url: {e}")))?;
        let capabilities_url = base
            .join("ocs/v1.php/cloud/capabilities?format=json")
            .map_err(|e| RemoteError::Protocol(format!("invalid capabilities url: {e}")))?;

        Ok(Self {
            http: Client::new(),
            files_url,
            uploads_url,
            capabilities_url,
            credentials,
            timeout,
        })
    }

    /// URL of a path inside the files namespace.
    fn file_url(&self, path: &SyncPath) -> Url {
        let mut url = self.files_url.clone();
        if !path.is_root() {
            url.path_segments_mut()
                .expect("files url is a base")
                .pop_if_empty()
                .extend(path.as_str().split('/'));
        }
        url
    }

    /// URL of a resource inside a chunked-upload session.
    fn upload_url(&self, transfer_id: u64, name: Option<&str>) -> Url {
        let mut url = self.uploads_url.clone();
        {
            let mut segments = url.path_segments_mut().expect("uploads url is a base");
            segments.pop_if_empty().push(&transfer_id.to_string());
            if let Some(name) = name {
                segments.push(name);
            }
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.credentials.user, Some(&self.credentials.secret))
            .timeout(self.timeout)
    }

    /// Maps transport failures onto the classified error type.
    fn transport_error(err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout
        } else {
            RemoteError::Network(err.to_string())
        }
    }

    /// Maps a non-success status onto the classified error type.
    fn status_error(status: StatusCode) -> RemoteError {
        if status == StatusCode::UNAUTHORIZED {
            RemoteError::AuthFailed
        } else {
            RemoteError::Http {
                code: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            }
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, RemoteError> {
        let response = builder.send().await.map_err(Self::transport_error)?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(Self::status_error(status))
        }
    }

    fn outcome_from_headers(headers: &HeaderMap) -> PutOutcome {
        let etag = headers
            .get("OC-ETag")
            .or_else(|| headers.get("ETag"))
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
            .and_then(|v| ETag::new(v).ok());
        let file_id = headers
            .get("OC-FileId")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| FileId::new(v).ok());
        PutOutcome { etag, file_id }
    }

    /// Turns a Multi-Status href back into a path relative to the root.
    fn href_to_path(&self, href: &str) -> Result<SyncPath, RemoteError> {
        let decoded = percent_decode_str(href)
            .decode_utf8()
            .map_err(|_| RemoteError::Protocol(format!("undecodable href {href:?}")))?;
        let prefix = self.files_url.path();
        let rel = decoded
            .strip_prefix(prefix)
            .ok_or_else(|| RemoteError::Protocol(format!("href {href:?} outside folder")))?
            .trim_end_matches('/');
        SyncPath::new(rel)
            .map_err(|e| RemoteError::Protocol(format!("invalid href {href:?}: {e}")))
    }

    fn raw_entry_to_remote(&self, raw: RawEntry) -> Result<RemoteEntry, RemoteError> {
        let path = self.href_to_path(&raw.href)?;
        Ok(RemoteEntry {
            path,
            size: raw.size,
            modtime: raw.modtime,
            etag: raw.etag.and_then(|e| ETag::new(e).ok()),
            file_id: raw.file_id.and_then(|f| FileId::new(f).ok()),
            permissions: raw.permissions,
            checksum_header: raw.checksum_header,
            is_collection: raw.is_collection,
        })
    }
}

#[async_trait::async_trait]
impl IRemoteStorage for DavClient {
    async fn capabilities(&self) -> Result<Capabilities, RemoteError> {
        let response = self
            .send(
                self.request(Method::GET, self.capabilities_url.clone())
                    .header("Accept", "application/json"),
            )
            .await?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RemoteError::Protocol(format!("capabilities not JSON: {e}")))?;
        let caps_obj = body
            .pointer("/ocs/data/capabilities")
            .unwrap_or(&body)
            .clone();
        Ok(Capabilities::from_json(&caps_obj))
    }

    async fn propfind(
        &self,
        path: &SyncPath,
        depth: Depth,
    ) -> Result<Vec<RemoteEntry>, RemoteError> {
        let method = Method::from_bytes(b"PROPFIND").expect("valid method");
        let response = self
            .request(method, self.file_url(path))
            .header("Depth", depth.header_value())
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(PROPFIND_BODY)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = response.status();
        if status != StatusCode::MULTI_STATUS {
            // A success code other than 207 is a protocol violation, not a
            // tolerable server quirk.
            if status.is_success() {
                return Err(RemoteError::Protocol(format!(
                    "PROPFIND returned {} instead of 207 Multi-Status",
                    status.as_u16()
                )));
            }
            return Err(Self::status_error(status));
        }

        let body = response.text().await.map_err(Self::transport_error)?;
        let raw = parse_multistatus(&body)?;
        raw.into_iter()
            .map(|entry| self.raw_entry_to_remote(entry))
            .collect()
    }

    async fn get(&self, path: &SyncPath) -> Result<RemoteDownload, RemoteError> {
        let response = self.send(self.request(Method::GET, self.file_url(path))).await?;
        let headers = response.headers().clone();
        let data = response
            .bytes()
            .await
            .map_err(Self::transport_error)?
            .to_vec();

        let header_str = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let outcome = Self::outcome_from_headers(&headers);
        Ok(RemoteDownload {
            data,
            etag: outcome.etag,
            file_id: outcome.file_id,
            checksum_header: header_str("OC-Checksum"),
            content_md5: header_str("Content-MD5"),
            modtime: header_str("X-OC-Mtime").and_then(|v| v.parse().ok()),
        })
    }

    async fn put_simple(
        &self,
        path: &SyncPath,
        data: Vec<u8>,
        modtime: i64,
        checksum: Option<&Checksum>,
    ) -> Result<PutOutcome, RemoteError> {
        let total = data.len() as u64;
        let mut builder = self
            .request(Method::PUT, self.file_url(path))
            .header("X-OC-Mtime", modtime.to_string())
            .header("OC-Total-Length", total.to_string())
            .header("Content-Type", "application/octet-stream")
            .body(data);
        if let Some(checksum) = checksum {
            builder = builder.header("OC-Checksum", checksum.to_string());
        }

        let response = self.send(builder).await?;
        Ok(Self::outcome_from_headers(response.headers()))
    }

    async fn mkcol(&self, path: &SyncPath) -> Result<PutOutcome, RemoteError> {
        let method = Method::from_bytes(b"MKCOL").expect("valid method");
        let response = self.send(self.request(method, self.file_url(path))).await?;
        Ok(Self::outcome_from_headers(response.headers()))
    }

    async fn move_item(
        &self,
        src: &SyncPath,
        dst: &SyncPath,
        overwrite: bool,
    ) -> Result<(), RemoteError> {
        let method = Method::from_bytes(b"MOVE").expect("valid method");
        self.send(
            self.request(method, self.file_url(src))
                .header("Destination", self.file_url(dst).to_string())
                .header("Overwrite", if overwrite { "T" } else { "F" }),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, path: &SyncPath) -> Result<(), RemoteError> {
        self.send(self.request(Method::DELETE, self.file_url(path)))
            .await?;
        Ok(())
    }

    async fn create_upload_session(&self, transfer_id: u64) -> Result<(), RemoteError> {
        let method = Method::from_bytes(b"MKCOL").expect("valid method");
        self.send(self.request(method, self.upload_url(transfer_id, None)))
            .await?;
        Ok(())
    }

    async fn put_chunk(
        &self,
        transfer_id: u64,
        offset: u64,
        data: Vec<u8>,
        total_size: u64,
    ) -> Result<(), RemoteError> {
        // Zero-padded offsets keep the server's directory listing in
        // chunk order.
        let chunk_name = format!("{offset:016}");
        self.send(
            self.request(Method::PUT, self.upload_url(transfer_id, Some(&chunk_name)))
                .header("OC-Total-Length", total_size.to_string())
                .header("Content-Type", "application/octet-stream")
                .body(data),
        )
        .await?;
        Ok(())
    }

    async fn finalize_upload(
        &self,
        transfer_id: u64,
        dst: &SyncPath,
        total_length: u64,
        modtime: i64,
        checksum: Option<&Checksum>,
    ) -> Result<PutOutcome, RemoteError> {
        let method = Method::from_bytes(b"MOVE").expect("valid method");
        let mut builder = self
            .request(method, self.upload_url(transfer_id, Some(".file")))
            .header("Destination", self.file_url(dst).to_string())
            .header("Overwrite", "T")
            .header("OC-Total-Length", total_length.to_string())
            .header("X-OC-Mtime", modtime.to_string());
        if let Some(checksum) = checksum {
            builder = builder.header("OC-Checksum", checksum.to_string());
        }

        let response = self.send(builder).await?;
        Ok(Self::outcome_from_headers(response.headers()))
    }
}
