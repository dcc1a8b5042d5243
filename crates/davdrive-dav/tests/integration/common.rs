//! Shared test helpers for DAV integration tests
//!
//! Spins up a wiremock server and returns a DavClient pointed at it.

use std::time::Duration;

use wiremock::MockServer;

use davdrive_dav::{DavClient, DavCredentials};

pub const TEST_USER: &str = "admin";

pub async fn setup() -> (MockServer, DavClient) {
    setup_with_timeout(Duration::from_secs(10)).await
}

pub async fn setup_with_timeout(timeout: Duration) -> (MockServer, DavClient) {
    let server = MockServer::start().await;
    let client = DavClient::new(
        &server.uri(),
        DavCredentials {
            user: TEST_USER.to_string(),
            secret: "test-password".to_string(),
        },
        timeout,
    )
    .unwrap();
    (server, client)
}

/// A minimal Multi-Status body for one directory with one file child.
pub fn multistatus_body() -> String {
    format!(
        r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:response>
    <d:href>/remote.php/dav/files/{user}/A/</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype><d:collection/></d:resourcetype>
        <d:getetag>"etag-dir-A"</d:getetag>
        <d:getlastmodified>Tue, 03 Feb 2026 10:00:00 GMT</d:getlastmodified>
        <oc:id>fid-dir-A</oc:id>
        <oc:permissions>RDNVCK</oc:permissions>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote.php/dav/files/{user}/A/a1</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype/>
        <d:getcontentlength>16</d:getcontentlength>
        <d:getlastmodified>Tue, 03 Feb 2026 11:00:00 GMT</d:getlastmodified>
        <d:getetag>"etag-a1"</d:getetag>
        <oc:id>fid-a1</oc:id>
        <oc:permissions>RDNVW</oc:permissions>
        <oc:checksums><oc:checksum>SHA1:19b1928d58a2030d08023f3d7054516dbc186f20</oc:checksum></oc:checksums>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#,
        user = TEST_USER
    )
}
