use std::time::Duration;

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use davdrive_core::domain::SyncPath;
use davdrive_core::ports::{Depth, IRemoteStorage, RemoteError};

use crate::common::{multistatus_body, setup, setup_with_timeout, TEST_USER};

fn dav_path(rel: &str) -> String {
    if rel.is_empty() {
        format!("/remote.php/dav/files/{TEST_USER}/")
    } else {
        format!("/remote.php/dav/files/{TEST_USER}/{rel}")
    }
}

async fn mount_propfind(server: &MockServer, rel: &str, template: ResponseTemplate) {
    Mock::given(method("PROPFIND"))
        .and(path(dav_path(rel)))
        .respond_with(template)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_propfind_parses_entries() {
    let (server, client) = setup().await;
    mount_propfind(
        &server,
        "A",
        ResponseTemplate::new(207).set_body_string(multistatus_body()),
    )
    .await;

    let entries = client
        .propfind(&SyncPath::new("A").unwrap(), Depth::One)
        .await
        .unwrap();

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].path.as_str(), "A");
    assert!(entries[0].is_collection);
    assert_eq!(entries[0].etag.as_ref().unwrap().as_str(), "etag-dir-A");

    assert_eq!(entries[1].path.as_str(), "A/a1");
    assert_eq!(entries[1].size, 16);
    assert_eq!(entries[1].file_id.as_ref().unwrap().as_str(), "fid-a1");
    assert_eq!(entries[1].permissions.as_deref(), Some("RDNVW"));
}

#[tokio::test]
async fn test_propfind_sends_depth_header() {
    let (server, client) = setup().await;
    Mock::given(method("PROPFIND"))
        .and(path(dav_path("A")))
        .and(header("Depth", "1"))
        .respond_with(ResponseTemplate::new(207).set_body_string(multistatus_body()))
        .expect(1)
        .mount(&server)
        .await;

    client
        .propfind(&SyncPath::new("A").unwrap(), Depth::One)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_propfind_200_is_protocol_error() {
    let (server, client) = setup().await;
    mount_propfind(
        &server,
        "A",
        ResponseTemplate::new(200).set_body_string(multistatus_body()),
    )
    .await;

    let err = client
        .propfind(&SyncPath::new("A").unwrap(), Depth::One)
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Protocol(_)));
}

#[tokio::test]
async fn test_propfind_truncated_xml() {
    let (server, client) = setup().await;
    let body = multistatus_body();
    let truncated = body[..body.len() - 20].to_string();
    mount_propfind(&server, "B", ResponseTemplate::new(207).set_body_string(truncated)).await;

    let err = client
        .propfind(&SyncPath::new("B").unwrap(), Depth::One)
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::InvalidXml));
    assert!(err.to_string().contains("Unknown error"));
}

#[tokio::test]
async fn test_propfind_error_statuses() {
    let (server, client) = setup().await;
    mount_propfind(&server, "forbidden", ResponseTemplate::new(403)).await;
    mount_propfind(&server, "gone", ResponseTemplate::new(404)).await;
    mount_propfind(&server, "auth", ResponseTemplate::new(401)).await;

    let err = client
        .propfind(&SyncPath::new("forbidden").unwrap(), Depth::One)
        .await
        .unwrap_err();
    assert!(err.is_soft_discovery_error());

    let err = client
        .propfind(&SyncPath::new("gone").unwrap(), Depth::One)
        .await
        .unwrap_err();
    assert_eq!(err.http_code(), Some(404));

    let err = client
        .propfind(&SyncPath::new("auth").unwrap(), Depth::One)
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::AuthFailed));
}

#[tokio::test]
async fn test_propfind_timeout() {
    let (server, client) = setup_with_timeout(Duration::from_secs(1)).await;
    mount_propfind(
        &server,
        "slow",
        ResponseTemplate::new(207)
            .set_body_string(multistatus_body())
            .set_delay(Duration::from_secs(5)),
    )
    .await;

    let err = client
        .propfind(&SyncPath::new("slow").unwrap(), Depth::One)
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Timeout));
    assert!(err.to_string().contains("Operation canceled"));
}
