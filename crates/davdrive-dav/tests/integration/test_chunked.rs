use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

use davdrive_core::domain::SyncPath;
use davdrive_core::ports::IRemoteStorage;

use crate::common::{setup, TEST_USER};

#[tokio::test]
async fn test_chunked_upload_sequence() {
    let (server, client) = setup().await;

    Mock::given(method("MKCOL"))
        .and(path(format!("/remote.php/dav/uploads/{TEST_USER}/7")))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path(format!(
            "/remote.php/dav/uploads/{TEST_USER}/7/0000000000000000"
        )))
        .and(header("OC-Total-Length", "20"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path(format!(
            "/remote.php/dav/uploads/{TEST_USER}/7/0000000000000016"
        )))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let destination = format!("{}/remote.php/dav/files/{TEST_USER}/big.bin", server.uri());
    Mock::given(method("MOVE"))
        .and(path(format!("/remote.php/dav/uploads/{TEST_USER}/7/.file")))
        .and(header("Destination", destination.as_str()))
        .and(header("OC-Total-Length", "20"))
        .and(header("X-OC-Mtime", "1700000000"))
        .respond_with(
            ResponseTemplate::new(201)
                .append_header("OC-ETag", "\"etag-big\"")
                .append_header("OC-FileId", "fid-big"),
        )
        .expect(1)
        .mount(&server)
        .await;

    client.create_upload_session(7).await.unwrap();
    client.put_chunk(7, 0, vec![0; 16], 20).await.unwrap();
    client.put_chunk(7, 16, vec![0; 4], 20).await.unwrap();
    let outcome = client
        .finalize_upload(7, &SyncPath::new("big.bin").unwrap(), 20, 1_700_000_000, None)
        .await
        .unwrap();

    assert_eq!(outcome.etag.unwrap().as_str(), "etag-big");
    assert_eq!(outcome.file_id.unwrap().as_str(), "fid-big");
}

#[tokio::test]
async fn test_finalize_failure_surfaces_status() {
    let (server, client) = setup().await;
    Mock::given(method("MOVE"))
        .and(path(format!("/remote.php/dav/uploads/{TEST_USER}/9/.file")))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = client
        .finalize_upload(9, &SyncPath::new("big.bin").unwrap(), 10, 0, None)
        .await
        .unwrap_err();
    assert_eq!(err.http_code(), Some(500));
}
