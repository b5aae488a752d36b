use std::time::{Duration, SystemTime};

use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Client, Method, StatusCode, redirect};
use thiserror::Error;
use url::Url;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const FILES_ENDPOINT: &str = "remote.php/dav/files";

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:displayname/>
    <d:getcontenttype/>
    <d:getcontentlength/>
    <d:getlastmodified/>
    <d:resourcetype/>
  </d:prop>
</d:propfind>"#;

#[derive(Debug, Error)]
pub enum DavError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("refusing to follow redirect ({status}) to {location:?}")]
    Redirect { status: StatusCode, location: String },
    #[error("{url} is not on remote host {expected}")]
    ForeignHost { url: String, expected: String },
    #[error("malformed dav response: {0}")]
    Protocol(String),
}

/// Only `Auth` (401) means the access token itself was refused. A 403 is a
/// permission problem on one resource and is not fixed by a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    Forbidden,
    Other,
}

/// One `<d:response>` of a multistatus listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DavEntry {
    pub href: String,
    pub display_name: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub last_modified: Option<SystemTime>,
    pub is_collection: bool,
}

impl DavEntry {
    /// Last segment of the href, percent-decoded.
    pub fn href_name(&self) -> String {
        let trimmed = self.href.trim_end_matches('/');
        let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
        urlencoding::decode(last)
            .map(|name| name.into_owned())
            .unwrap_or_else(|_| last.to_string())
    }
}

#[derive(Clone)]
pub struct DavClient {
    http: Client,
    base_url: Url,
    account: String,
}

impl DavClient {
    pub fn new(base_url: &str, account: impl Into<String>) -> Result<Self, DavError> {
        Self::with_timeout(base_url, account, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        account: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DavError> {
        let http = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url.trim_end_matches('/'))?,
            account: account.into(),
        })
    }

    /// Collection URL of `folder` inside the account's file space. Each folder
    /// segment is percent-encoded on its own so nested folders keep their `/`.
    pub fn folder_url(&self, folder: &str) -> Result<Url, DavError> {
        let mut path = format!("{FILES_ENDPOINT}/{}", urlencoding::encode(&self.account));
        for segment in folder.split('/').filter(|segment| !segment.is_empty()) {
            path.push('/');
            path.push_str(&urlencoding::encode(segment));
        }
        path.push('/');
        Ok(join_base(self.base_url.as_str(), &path)?)
    }

    /// Shallow (`Depth: 1`) listing of a folder. The folder itself is part of
    /// the returned entries, flagged as a collection.
    pub async fn list_folder(&self, token: &str, folder: &str) -> Result<Vec<DavEntry>, DavError> {
        let url = self.folder_url(folder)?;
        let method =
            Method::from_bytes(b"PROPFIND").map_err(|err| DavError::Protocol(err.to_string()))?;
        let response = self
            .http
            .request(method, url)
            .bearer_auth(token)
            .header("Depth", "1")
            .header(CONTENT_TYPE, "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let xml = response.text().await?;
        parse_multistatus(&xml)
    }

    /// Resolves an href from a listing against the base URL, refusing anything
    /// that lands on another host.
    pub fn resolve_href(&self, href: &str) -> Result<Url, DavError> {
        let url = self.base_url.join(href)?;
        self.ensure_same_host(&url)?;
        Ok(url)
    }

    pub async fn download(&self, token: &str, url: &Url) -> Result<Vec<u8>, DavError> {
        self.ensure_same_host(url)?;
        let response = self
            .http
            .get(url.clone())
            .bearer_auth(token)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    fn ensure_same_host(&self, url: &Url) -> Result<(), DavError> {
        let same = url.host_str() == self.base_url.host_str()
            && url.port_or_known_default() == self.base_url.port_or_known_default();
        if same {
            Ok(())
        } else {
            Err(DavError::ForeignHost {
                url: url.to_string(),
                expected: self.base_url.host_str().unwrap_or_default().to_string(),
            })
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DavError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            return Err(DavError::Redirect { status, location });
        }
        let body = response.text().await.unwrap_or_default();
        Err(DavError::Api { status, body })
    }
}

impl DavError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DavError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::Auth))
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    match status {
        StatusCode::UNAUTHORIZED => ApiErrorClass::Auth,
        StatusCode::FORBIDDEN => ApiErrorClass::Forbidden,
        _ => ApiErrorClass::Other,
    }
}

pub(crate) fn join_base(base_url: &str, path: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    ))
}

fn parse_multistatus(xml: &str) -> Result<Vec<DavEntry>, DavError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<DavEntry> = None;
    let mut element: Vec<u8> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"response" => current = Some(DavEntry::default()),
                b"collection" => mark_collection(current.as_mut()),
                other => element = other.to_vec(),
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"collection" {
                    mark_collection(current.as_mut());
                }
            }
            Ok(Event::Text(text)) => {
                let Some(entry) = current.as_mut() else {
                    continue;
                };
                let value = text
                    .unescape()
                    .map_err(|err| DavError::Protocol(err.to_string()))?
                    .into_owned();
                apply_property(entry, &element, value);
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"response"
                    && let Some(entry) = current.take()
                    && !entry.href.is_empty()
                {
                    entries.push(entry);
                }
                element.clear();
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(DavError::Protocol(err.to_string())),
            _ => {}
        }
    }

    Ok(entries)
}

fn mark_collection(entry: Option<&mut DavEntry>) {
    if let Some(entry) = entry {
        entry.is_collection = true;
    }
}

fn apply_property(entry: &mut DavEntry, element: &[u8], value: String) {
    match element {
        b"href" => entry.href = value,
        b"displayname" => entry.display_name = Some(value),
        b"getcontenttype" => entry.content_type = Some(value),
        b"getcontentlength" => entry.content_length = value.trim().parse().ok(),
        b"getlastmodified" => entry.last_modified = httpdate::parse_http_date(value.trim()).ok(),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/remote.php/dav/files/alice/mirror/</d:href>
    <d:propstat>
      <d:prop>
        <d:displayname>mirror</d:displayname>
        <d:resourcetype><d:collection/></d:resourcetype>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote.php/dav/files/alice/mirror/Beach%20Day.jpg</d:href>
    <d:propstat>
      <d:prop>
        <d:displayname>Beach Day.jpg</d:displayname>
        <d:getcontenttype>image/jpeg</d:getcontenttype>
        <d:getcontentlength>2048</d:getcontentlength>
        <d:getlastmodified>Tue, 02 Jan 2024 10:00:00 GMT</d:getlastmodified>
        <d:resourcetype/>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn parses_entries_and_flags_collections() {
        let entries = parse_multistatus(LISTING).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_collection);

        let photo = &entries[1];
        assert!(!photo.is_collection);
        assert_eq!(photo.display_name.as_deref(), Some("Beach Day.jpg"));
        assert_eq!(photo.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(photo.content_length, Some(2048));
        assert_eq!(
            photo.last_modified,
            Some(httpdate::parse_http_date("Tue, 02 Jan 2024 10:00:00 GMT").unwrap())
        );
        assert_eq!(photo.href_name(), "Beach Day.jpg");
    }

    #[test]
    fn rejects_malformed_xml() {
        let err = parse_multistatus("<d:multistatus xmlns:d=\"DAV:\"><d:response></d:oops>")
            .expect_err("mismatched tags should fail");
        assert!(matches!(err, DavError::Protocol(_)));
    }

    #[test]
    fn classifies_statuses() {
        let auth = DavError::Api {
            status: StatusCode::UNAUTHORIZED,
            body: String::new(),
        };
        assert!(auth.is_auth());
        let forbidden = DavError::Api {
            status: StatusCode::FORBIDDEN,
            body: String::new(),
        };
        assert_eq!(forbidden.classification(), Some(ApiErrorClass::Forbidden));
        assert!(!forbidden.is_auth());
        let busy = DavError::Api {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        };
        assert!(!busy.is_auth());
        assert!(DavError::Protocol("bad xml".into()).classification().is_none());
    }

    #[test]
    fn folder_url_encodes_each_segment() {
        let client = DavClient::new("https://cloud.example/nextcloud/", "alice smith").unwrap();
        let url = client.folder_url("/Family/Summer 2024").unwrap();
        assert_eq!(
            url.as_str(),
            "https://cloud.example/nextcloud/remote.php/dav/files/alice%20smith/Family/Summer%202024/"
        );
    }

    #[test]
    fn resolve_href_refuses_other_hosts() {
        let client = DavClient::new("https://cloud.example", "alice").unwrap();
        let ok = client
            .resolve_href("/remote.php/dav/files/alice/mirror/a.jpg")
            .unwrap();
        assert_eq!(ok.host_str(), Some("cloud.example"));

        let err = client
            .resolve_href("//evil.example/a.jpg")
            .expect_err("scheme-relative href must be refused");
        assert!(matches!(err, DavError::ForeignHost { .. }));
    }
}
