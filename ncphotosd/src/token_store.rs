use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ncphotos_core::{OAuthClient, OAuthError};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::storage::{StorageError, TokenFile, TokenRecord};

/// Margin subtracted from the expiry so a token is not used while it is about
/// to lapse mid-request.
pub const REFRESH_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("credentials missing at {}: {reason}", path.display())]
    CredentialsMissing { path: PathBuf, reason: String },
    #[error("refresh token is missing")]
    MissingRefreshToken,
    #[error("oauth refresh failed: {0}")]
    Exchange(#[from] OAuthError),
}

/// Owns the token record. The record lock is held across the whole refresh
/// exchange, so concurrent callers wait for one in-flight refresh instead of
/// spending the refresh token twice.
pub struct TokenStore {
    file: TokenFile,
    oauth: OAuthClient,
    state: Mutex<TokenRecord>,
    skew_ms: i64,
}

impl TokenStore {
    pub fn load(file: TokenFile, timeout: Duration) -> Result<Self, TokenError> {
        let missing = |reason: String| TokenError::CredentialsMissing {
            path: file.path().to_path_buf(),
            reason,
        };
        let record = file.load().map_err(|err| match err {
            StorageError::TokenNotFound(_) => missing("no token record".to_string()),
            other => missing(other.to_string()),
        })?;
        let oauth = OAuthClient::with_timeout(
            &record.remote_base_url,
            record.client_id.clone(),
            record.client_secret.clone(),
            timeout,
        )
        .map_err(|err| missing(format!("unusable remote base url: {err}")))?;
        Ok(Self::from_parts(file, oauth, record))
    }

    pub fn from_parts(file: TokenFile, oauth: OAuthClient, record: TokenRecord) -> Self {
        Self {
            file,
            oauth,
            state: Mutex::new(record),
            skew_ms: REFRESH_SKEW.as_millis() as i64,
        }
    }

    pub async fn snapshot(&self) -> TokenRecord {
        self.state.lock().await.clone()
    }

    pub async fn is_expired(&self, now: SystemTime) -> bool {
        self.state
            .lock()
            .await
            .is_expired_at(unix_millis(now), self.skew_ms)
    }

    /// Current access token, refreshed first when it is expired or close to it.
    pub async fn valid_token(&self) -> Result<String, TokenError> {
        let mut state = self.state.lock().await;
        if state.is_expired_at(unix_millis(SystemTime::now()), self.skew_ms) {
            self.refresh_locked(&mut state).await?;
        }
        Ok(state.access_token.clone())
    }

    /// Unconditional refresh.
    pub async fn refresh(&self) -> Result<String, TokenError> {
        let mut state = self.state.lock().await;
        self.refresh_locked(&mut state).await?;
        Ok(state.access_token.clone())
    }

    /// Refresh after the remote refused `rejected`. If another caller already
    /// replaced that token, the replacement is returned without a new exchange.
    pub async fn refresh_rejected(&self, rejected: &str) -> Result<String, TokenError> {
        let mut state = self.state.lock().await;
        if state.access_token != rejected {
            return Ok(state.access_token.clone());
        }
        self.refresh_locked(&mut state).await?;
        Ok(state.access_token.clone())
    }

    async fn refresh_locked(&self, state: &mut TokenRecord) -> Result<(), TokenError> {
        if !state.can_refresh() {
            return Err(TokenError::MissingRefreshToken);
        }
        let refresh_token = state.refresh_token.clone().unwrap_or_default();
        let token = self.oauth.refresh_token(&refresh_token).await?;
        let refreshed = state.refreshed(&token, unix_millis(SystemTime::now()));
        if let Err(err) = self.file.save(&refreshed) {
            tracing::error!(
                path = %self.file.path().display(),
                "failed to persist refreshed token record: {err}"
            );
        }
        *state = refreshed;
        tracing::info!("access token refreshed");
        Ok(())
    }
}

fn unix_millis(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
