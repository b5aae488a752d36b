use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use ncphotos_core::{ApiErrorClass, DavClient, DavError};

const MULTISTATUS: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:response>
    <d:href>/remote.php/dav/files/alice/mirror/</d:href>
    <d:propstat>
      <d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote.php/dav/files/alice/mirror/a.jpg</d:href>
    <d:propstat>
      <d:prop>
        <d:displayname>a.jpg</d:displayname>
        <d:getcontenttype>image/jpeg</d:getcontenttype>
        <d:getcontentlength>5</d:getcontentlength>
        <d:getlastmodified>Mon, 01 Jan 2024 00:00:00 GMT</d:getlastmodified>
        <d:resourcetype/>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

#[tokio::test]
async fn list_folder_sends_shallow_propfind_with_bearer() {
    let server = MockServer::start().await;

    Mock::given(method("PROPFIND"))
        .and(path("/remote.php/dav/files/alice/mirror/"))
        .and(header("authorization", "Bearer test-token"))
        .and(header("depth", "1"))
        .and(body_string_contains("getlastmodified"))
        .respond_with(
            ResponseTemplate::new(207)
                .insert_header("content-type", "application/xml; charset=utf-8")
                .set_body_string(MULTISTATUS),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = DavClient::new(&server.uri(), "alice").unwrap();
    let entries = client.list_folder("test-token", "mirror").await.unwrap();

    assert_eq!(entries.len(), 2);
    assert!(entries[0].is_collection);
    assert_eq!(entries[1].display_name.as_deref(), Some("a.jpg"));
    assert_eq!(entries[1].content_length, Some(5));
}

#[tokio::test]
async fn list_folder_reports_auth_rejection() {
    let server = MockServer::start().await;

    Mock::given(method("PROPFIND"))
        .and(path("/remote.php/dav/files/alice/mirror/"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = DavClient::new(&server.uri(), "alice").unwrap();
    let err = client
        .list_folder("stale", "mirror")
        .await
        .expect_err("401 should fail");

    assert_eq!(err.classification(), Some(ApiErrorClass::Auth));
}

#[tokio::test]
async fn download_returns_body_bytes() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/remote.php/dav/files/alice/mirror/a.jpg"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
        .mount(&server)
        .await;

    let client = DavClient::new(&server.uri(), "alice").unwrap();
    let url = client
        .resolve_href("/remote.php/dav/files/alice/mirror/a.jpg")
        .unwrap();
    let bytes = client.download("test-token", &url).await.unwrap();

    assert_eq!(bytes, b"hello");
}

#[tokio::test]
async fn download_does_not_follow_redirects() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/remote.php/dav/files/alice/mirror/a.jpg"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("location", "https://elsewhere.example/a.jpg"),
        )
        .mount(&server)
        .await;

    let client = DavClient::new(&server.uri(), "alice").unwrap();
    let url = client
        .resolve_href("/remote.php/dav/files/alice/mirror/a.jpg")
        .unwrap();
    let err = client
        .download("test-token", &url)
        .await
        .expect_err("redirect should be refused");

    match err {
        DavError::Redirect { location, .. } => {
            assert_eq!(location, "https://elsewhere.example/a.jpg");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
