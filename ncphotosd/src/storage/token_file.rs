use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use ncphotos_core::OAuthToken;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("token record not found at {0}")]
    TokenNotFound(PathBuf),
    #[error("token record at {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("I/O error on token record: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode token record: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Persisted OAuth2 credentials plus the remote they belong to.
///
/// `expires_at` is in unix milliseconds. Older records written by the
/// provisioning script use `nextcloud_url` / `username`, accepted as aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub expires_at: i64,
    pub client_id: String,
    pub client_secret: String,
    #[serde(alias = "nextcloud_url")]
    pub remote_base_url: String,
    #[serde(default, alias = "username")]
    pub account_name: String,
}

impl TokenRecord {
    /// True once `now_ms` is within `skew_ms` of the recorded expiry.
    pub fn is_expired_at(&self, now_ms: i64, skew_ms: i64) -> bool {
        now_ms >= self.expires_at.saturating_sub(skew_ms)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token
            .as_deref()
            .is_some_and(|token| !token.is_empty())
    }

    /// New record after a successful refresh grant. A response without a
    /// refresh token keeps the current one.
    pub fn refreshed(&self, token: &OAuthToken, now_ms: i64) -> Self {
        let expires_in = token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        Self {
            access_token: token.access_token.clone(),
            refresh_token: token
                .refresh_token
                .clone()
                .or_else(|| self.refresh_token.clone()),
            token_type: token.token_type.clone(),
            expires_in: Some(expires_in),
            expires_at: now_ms.saturating_add((expires_in as i64).saturating_mul(1000)),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            remote_base_url: self.remote_base_url.clone(),
            account_name: self.account_name.clone(),
        }
    }
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// JSON token record at a fixed path, rewritten through a temp file and rename.
#[derive(Debug, Clone)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<TokenRecord, StorageError> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::TokenNotFound(self.path.clone()));
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_str(&data).map_err(|source| StorageError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    pub fn save(&self, record: &TokenRecord) -> Result<(), StorageError> {
        ensure_parent(&self.path)?;
        let payload = serde_json::to_vec_pretty(record).map_err(StorageError::Encode)?;

        let temp = temp_path(&self.path);
        let mut file = restricted_options().open(&temp)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        drop(file);

        if let Err(err) = fs::rename(&temp, &self.path) {
            let _ = fs::remove_file(&temp);
            return Err(err.into());
        }
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn restricted_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.create(true).truncate(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}
