use std::time::SystemTime;

use ncphotos_core::{DavClient, DavEntry, DavError};
use thiserror::Error;

use super::paths::sanitize_file_name;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "bmp", "tiff"];

/// One photo as reported by the remote listing. Built fresh every cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePhotoDescriptor {
    pub display_name: String,
    pub remote_href: String,
    pub content_type: Option<String>,
    pub byte_size: Option<u64>,
    pub last_modified: Option<SystemTime>,
}

#[derive(Debug, Error)]
pub enum ListError {
    #[error("listing rejected by remote: {0}")]
    AuthRejected(DavError),
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(DavError),
}

impl From<DavError> for ListError {
    fn from(err: DavError) -> Self {
        if err.is_auth() {
            ListError::AuthRejected(err)
        } else {
            ListError::RemoteUnavailable(err)
        }
    }
}

#[derive(Clone)]
pub struct RemoteLister {
    dav: DavClient,
}

impl RemoteLister {
    pub fn new(dav: DavClient) -> Self {
        Self { dav }
    }

    pub async fn list(
        &self,
        token: &str,
        folder: &str,
    ) -> Result<Vec<RemotePhotoDescriptor>, ListError> {
        let entries = self.dav.list_folder(token, folder).await?;
        let total = entries.len();
        let photos: Vec<_> = entries.iter().filter_map(descriptor_from_entry).collect();
        tracing::debug!(folder, total, photos = photos.len(), "remote folder listed");
        Ok(photos)
    }
}

/// Declared content type OR extension, since servers do not always report a
/// usable type.
pub fn is_image(content_type: Option<&str>, name: &str) -> bool {
    let declared = content_type
        .map(|value| value.trim().to_ascii_lowercase().starts_with("image/"))
        .unwrap_or(false);
    declared || has_image_extension(name)
}

fn has_image_extension(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

fn descriptor_from_entry(entry: &DavEntry) -> Option<RemotePhotoDescriptor> {
    if entry.is_collection {
        return None;
    }
    let raw_name = entry
        .display_name
        .clone()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| entry.href_name());
    if !is_image(entry.content_type.as_deref(), &raw_name) {
        return None;
    }
    Some(RemotePhotoDescriptor {
        display_name: sanitize_file_name(&raw_name),
        remote_href: entry.href.clone(),
        content_type: entry.content_type.clone(),
        byte_size: entry.content_length,
        last_modified: entry.last_modified,
    })
}
