use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use davdrive_core::domain::ChecksumAlgorithm;
use davdrive_core::ports::IRemoteStorage;

use crate::common::setup;

#[tokio::test]
async fn test_capabilities_from_ocs_envelope() {
    let (server, client) = setup().await;
    Mock::given(method("GET"))
        .and(path("/ocs/v1.php/cloud/capabilities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ocs": {
                "data": {
                    "capabilities": {
                        "dav": {
                            "chunking": "1.0",
                            "checksums": {
                                "supportedTypes": ["SHA1", "MD5", "ADLER32"],
                                "preferredUploadType": "SHA1"
                            },
                            "httpErrorCodesThatResetFailingChunkedUploads": [500]
                        }
                    }
                }
            }
        })))
        .mount(&server)
        .await;

    let caps = client.capabilities().await.unwrap();
    assert_eq!(caps.preferred_upload_checksum, Some(ChecksumAlgorithm::Sha1));
    assert_eq!(caps.chunking_version.as_deref(), Some("1.0"));
    assert!(caps.resets_chunked_upload(500));
}

#[tokio::test]
async fn test_capabilities_empty_document() {
    let (server, client) = setup().await;
    Mock::given(method("GET"))
        .and(path("/ocs/v1.php/cloud/capabilities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&server)
        .await;

    let caps = client.capabilities().await.unwrap();
    assert!(caps.supported_checksum_types.is_empty());
    assert!(caps.upload_reset_codes.is_empty());
}
