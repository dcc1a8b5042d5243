//! Server capability negotiation
//!
//! Capabilities arrive as the `dav` object of the server's capabilities
//! JSON. Everything is optional on the wire; missing values fall back to
//! conservative defaults.

use regex::Regex;
use serde_json::Value;

use crate::domain::checksum::ChecksumAlgorithm;

/// Negotiated server capabilities consumed by the engine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capabilities {
    /// Checksum algorithms the server can verify on upload.
    pub supported_checksum_types: Vec<ChecksumAlgorithm>,
    /// The algorithm the server prefers for `OC-Checksum` on PUT.
    pub preferred_upload_checksum: Option<ChecksumAlgorithm>,
    /// Names matching this pattern are rejected by the server and must not
    /// be uploaded.
    pub invalid_filename_regex: Option<String>,
    /// HTTP codes that invalidate a stored chunked-upload session.
    pub upload_reset_codes: Vec<u16>,
    /// Chunking protocol version advertised by the server.
    pub chunking_version: Option<String>,
}

impl Capabilities {
    /// Parses the `dav` section of a capabilities JSON document.
    ///
    /// Accepts either the full document (`{"dav": {...}}`) or the `dav`
    /// object directly.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        let dav = value.get("dav").unwrap_or(value);

        let checksums = dav.get("checksums");
        let supported_checksum_types = checksums
            .and_then(|c| c.get("supportedTypes"))
            .and_then(Value::as_array)
            .map(|types| {
                types
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(ChecksumAlgorithm::parse)
                    .collect()
            })
            .unwrap_or_default();

        let preferred_upload_checksum = checksums
            .and_then(|c| c.get("preferredUploadType"))
            .and_then(Value::as_str)
            .and_then(ChecksumAlgorithm::parse);

        let invalid_filename_regex = dav
            .get("invalidFilenameRegex")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let upload_reset_codes = dav
            .get("httpErrorCodesThatResetFailingChunkedUploads")
            .and_then(Value::as_array)
            .map(|codes| {
                codes
                    .iter()
                    .filter_map(Value::as_u64)
                    .filter_map(|c| u16::try_from(c).ok())
                    .collect()
            })
            .unwrap_or_default();

        let chunking_version = dav
            .get("chunking")
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            supported_checksum_types,
            preferred_upload_checksum,
            invalid_filename_regex,
            upload_reset_codes,
            chunking_version,
        }
    }

    /// The algorithm to use for upload checksums: the server's preference
    /// if supported, otherwise the strongest supported algorithm.
    #[must_use]
    pub fn upload_checksum_algorithm(&self) -> Option<ChecksumAlgorithm> {
        if let Some(preferred) = self.preferred_upload_checksum {
            if self.supported_checksum_types.contains(&preferred) {
                return Some(preferred);
            }
        }
        self.supported_checksum_types
            .iter()
            .copied()
            .max_by_key(ChecksumAlgorithm::strength)
    }

    /// Compiles the server's invalid-filename pattern, if any.
    ///
    /// An unparsable pattern is treated as absent and logged by the caller.
    #[must_use]
    pub fn invalid_filename_pattern(&self) -> Option<Regex> {
        self.invalid_filename_regex
            .as_deref()
            .and_then(|pattern| Regex::new(pattern).ok())
    }

    /// Whether `code` should reset a failing chunked upload.
    #[must_use]
    pub fn resets_chunked_upload(&self, code: u16) -> bool {
        self.upload_reset_codes.contains(&code)
    }
}
