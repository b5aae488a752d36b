use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use ncphotos_core::{DavClient, DavError};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

use super::lister::RemotePhotoDescriptor;
use super::paths::{PathError, cache_path_for, local_name_for};
use super::transform::{ImageTransform, TransformError};

/// A photo present in the local cache, as handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedPhoto {
    #[serde(rename = "name")]
    pub local_name: String,
    #[serde(rename = "path")]
    pub local_file_path: PathBuf,
    #[serde(rename = "url")]
    pub public_reference: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("download of {name} rejected by remote")]
    AuthRejected { name: String },
    #[error("path error: {0}")]
    PathEscape(#[from] PathError),
    #[error("refusing to fetch {name}: {source}")]
    UnsafeRedirect { name: String, source: DavError },
    #[error("download of {name} failed: {reason}")]
    DownloadFailed { name: String, reason: String },
    #[error("transform of {name} failed: {source}")]
    Transform {
        name: String,
        source: TransformError,
    },
    #[error("cannot write {name} to cache: {source}")]
    Io { name: String, source: io::Error },
}

impl FetchError {
    pub fn is_auth(&self) -> bool {
        matches!(self, FetchError::AuthRejected { .. })
    }
}

#[derive(Clone)]
pub struct PhotoFetcher {
    dav: DavClient,
    cache_root: PathBuf,
    public_prefix: String,
    transform: Option<ImageTransform>,
    transform_limit: Arc<Semaphore>,
}

impl PhotoFetcher {
    pub fn new(dav: DavClient, cache_root: PathBuf, public_prefix: impl Into<String>) -> Self {
        Self {
            dav,
            cache_root,
            public_prefix: public_prefix.into(),
            transform: None,
            transform_limit: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn with_transform(mut self, transform: Option<ImageTransform>) -> Self {
        self.transform = transform;
        self
    }

    /// Whether cached files are re-encoded, which also fixes their extension.
    pub fn transcodes(&self) -> bool {
        self.transform.is_some()
    }

    pub async fn fetch(
        &self,
        token: &str,
        descriptor: &RemotePhotoDescriptor,
    ) -> Result<CachedPhoto, FetchError> {
        let local_name = local_name_for(&descriptor.display_name, self.transcodes());
        self.fetch_as(token, descriptor, &local_name).await
    }

    /// Fetches `descriptor` into the cache under an already assigned name.
    /// A fresh cached copy is returned without touching the network.
    pub async fn fetch_as(
        &self,
        token: &str,
        descriptor: &RemotePhotoDescriptor,
        local_name: &str,
    ) -> Result<CachedPhoto, FetchError> {
        let target = cache_path_for(&self.cache_root, local_name)?;
        let photo = CachedPhoto {
            local_name: local_name.to_string(),
            local_file_path: target.clone(),
            public_reference: format!("{}{}", self.public_prefix, urlencoding::encode(local_name)),
        };

        if is_fresh(&target, descriptor.last_modified).await {
            tracing::debug!(name = local_name, "cached copy is fresh");
            return Ok(photo);
        }

        let name = || local_name.to_string();
        let url = self
            .dav
            .resolve_href(&descriptor.remote_href)
            .map_err(|source| FetchError::UnsafeRedirect {
                name: name(),
                source,
            })?;
        let bytes = match self.dav.download(token, &url).await {
            Ok(bytes) => bytes,
            Err(err) if err.is_auth() => return Err(FetchError::AuthRejected { name: name() }),
            Err(source @ (DavError::Redirect { .. } | DavError::ForeignHost { .. })) => {
                return Err(FetchError::UnsafeRedirect {
                    name: name(),
                    source,
                });
            }
            Err(err) => {
                return Err(FetchError::DownloadFailed {
                    name: name(),
                    reason: err.to_string(),
                });
            }
        };
        if bytes.is_empty() {
            return Err(FetchError::DownloadFailed {
                name: name(),
                reason: "empty response body".to_string(),
            });
        }

        let bytes = match self.transform {
            Some(transform) => self.run_transform(transform, bytes, local_name).await?,
            None => bytes,
        };

        write_atomically(&target, &bytes)
            .await
            .map_err(|source| FetchError::Io {
                name: name(),
                source,
            })?;
        tracing::info!(name = local_name, bytes = bytes.len(), "photo cached");
        Ok(photo)
    }

    async fn run_transform(
        &self,
        transform: ImageTransform,
        bytes: Vec<u8>,
        local_name: &str,
    ) -> Result<Vec<u8>, FetchError> {
        let failed = |source| FetchError::Transform {
            name: local_name.to_string(),
            source,
        };
        let _permit = self
            .transform_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| failed(TransformError::Worker("limiter is closed".to_string())))?;

        let before = bytes.len();
        let output = tokio::task::spawn_blocking(move || transform.apply(&bytes))
            .await
            .map_err(|err| failed(TransformError::Worker(err.to_string())))?
            .map_err(failed)?;
        tracing::debug!(
            name = local_name,
            before,
            after = output.len(),
            "photo transformed"
        );
        Ok(output)
    }
}

/// A cached copy is fresh when it is a non-empty regular file modified no
/// earlier than the remote copy. A missing remote timestamp counts as the
/// epoch.
async fn is_fresh(target: &Path, remote_modified: Option<SystemTime>) -> bool {
    let Ok(metadata) = tokio::fs::symlink_metadata(target).await else {
        return false;
    };
    if !metadata.is_file() || metadata.len() == 0 {
        return false;
    }
    let remote_modified = remote_modified.unwrap_or(UNIX_EPOCH);
    metadata
        .modified()
        .map(|local| local >= remote_modified)
        .unwrap_or(false)
}

async fn write_atomically(target: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(target);
    let mut file = tokio::fs::File::create(&partial).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Err(err) = tokio::fs::rename(&partial, target).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(err);
    }
    Ok(())
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}
