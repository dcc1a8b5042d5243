use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

use davdrive_core::domain::{Checksum, ChecksumAlgorithm, SyncPath};
use davdrive_core::ports::{IRemoteStorage, RemoteError};

use crate::common::{setup, TEST_USER};

#[tokio::test]
async fn test_get_returns_body_and_headers() {
    let (server, client) = setup().await;
    Mock::given(method("GET"))
        .and(path(format!("/remote.php/dav/files/{TEST_USER}/A/a1")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![b'A'; 16])
                .append_header("OC-Checksum", "SHA1:19b1928d58a2030d08023f3d7054516dbc186f20")
                .append_header("Content-MD5", "d8a73157ce10cd94a91c2079fc9a92c8")
                .append_header("OC-ETag", "\"etag-a1\"")
                .append_header("OC-FileId", "fid-a1")
                .append_header("X-OC-Mtime", "1700000000"),
        )
        .mount(&server)
        .await;

    let download = client.get(&SyncPath::new("A/a1").unwrap()).await.unwrap();
    assert_eq!(download.data, vec![b'A'; 16]);
    assert_eq!(
        download.checksum_header.as_deref(),
        Some("SHA1:19b1928d58a2030d08023f3d7054516dbc186f20")
    );
    assert_eq!(
        download.content_md5.as_deref(),
        Some("d8a73157ce10cd94a91c2079fc9a92c8")
    );
    assert_eq!(download.etag.unwrap().as_str(), "etag-a1");
    assert_eq!(download.file_id.unwrap().as_str(), "fid-a1");
    assert_eq!(download.modtime, Some(1_700_000_000));
}

#[tokio::test]
async fn test_put_simple_sends_oc_headers() {
    let (server, client) = setup().await;
    Mock::given(method("PUT"))
        .and(path(format!("/remote.php/dav/files/{TEST_USER}/new.txt")))
        .and(header("X-OC-Mtime", "1700000000"))
        .and(header("OC-Total-Length", "4"))
        .and(header("OC-Checksum", "SHA1:aabb"))
        .respond_with(
            ResponseTemplate::new(201)
                .append_header("OC-ETag", "\"etag-new\"")
                .append_header("OC-FileId", "fid-new"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let checksum = Checksum::new(ChecksumAlgorithm::Sha1, "aabb");
    let outcome = client
        .put_simple(
            &SyncPath::new("new.txt").unwrap(),
            b"data".to_vec(),
            1_700_000_000,
            Some(&checksum),
        )
        .await
        .unwrap();

    assert_eq!(outcome.etag.unwrap().as_str(), "etag-new");
    assert_eq!(outcome.file_id.unwrap().as_str(), "fid-new");
}

#[tokio::test]
async fn test_put_507_maps_to_insufficient_storage() {
    let (server, client) = setup().await;
    Mock::given(method("PUT"))
        .and(path(format!("/remote.php/dav/files/{TEST_USER}/big")))
        .respond_with(ResponseTemplate::new(507))
        .mount(&server)
        .await;

    let err = client
        .put_simple(&SyncPath::new("big").unwrap(), vec![0; 1200], 0, None)
        .await
        .unwrap_err();
    assert!(err.is_insufficient_storage());
}

#[tokio::test]
async fn test_move_sends_destination_and_overwrite() {
    let (server, client) = setup().await;
    let destination = format!(
        "{}/remote.php/dav/files/{TEST_USER}/A/a1m",
        server.uri()
    );
    Mock::given(method("MOVE"))
        .and(path(format!("/remote.php/dav/files/{TEST_USER}/A/a1")))
        .and(header("Destination", destination.as_str()))
        .and(header("Overwrite", "F"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    client
        .move_item(
            &SyncPath::new("A/a1").unwrap(),
            &SyncPath::new("A/a1m").unwrap(),
            false,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_and_mkcol() {
    let (server, client) = setup().await;
    Mock::given(method("DELETE"))
        .and(path(format!("/remote.php/dav/files/{TEST_USER}/A/a1")))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("MKCOL"))
        .and(path(format!("/remote.php/dav/files/{TEST_USER}/newdir")))
        .respond_with(ResponseTemplate::new(201).append_header("OC-FileId", "fid-newdir"))
        .expect(1)
        .mount(&server)
        .await;

    client.delete(&SyncPath::new("A/a1").unwrap()).await.unwrap();
    let outcome = client.mkcol(&SyncPath::new("newdir").unwrap()).await.unwrap();
    assert_eq!(outcome.file_id.unwrap().as_str(), "fid-newdir");
}

#[tokio::test]
async fn test_503_is_transient() {
    let (server, client) = setup().await;
    Mock::given(method("GET"))
        .and(path(format!("/remote.php/dav/files/{TEST_USER}/flaky")))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = client.get(&SyncPath::new("flaky").unwrap()).await.unwrap_err();
    assert!(matches!(err, RemoteError::Http { code: 503, .. }));
    assert!(err.is_transient());
}
