use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ncphotos_core::DavClient;

use crate::events::{EventSender, SyncEvent};
use crate::storage::TokenFile;
use crate::sync::engine::{CycleReport, EngineConfig, SyncEngine};
use crate::sync::transform::{
    DEFAULT_MAX_HEIGHT, DEFAULT_MAX_WIDTH, DEFAULT_QUALITY, ImageTransform,
};
use crate::token_store::TokenStore;

const APP_DIR_NAME: &str = "ncphotos";
const TOKEN_FILE_NAME: &str = "tokens.json";
const DEFAULT_FOLDER: &str = "mirror";
const DEFAULT_PUBLIC_PREFIX: &str = "/cache/";
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 600;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_FETCH_CONCURRENCY: u64 = 2;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// Overrides the base URL stored in the token record.
    pub base_url: Option<String>,
    /// Overrides the account stored in the token record.
    pub account: Option<String>,
    pub folder: String,
    pub cache_root: PathBuf,
    pub token_file: PathBuf,
    pub sync_interval: Duration,
    pub request_timeout: Duration,
    pub max_width: u32,
    pub max_height: u32,
    pub image_quality: u32,
    pub transform_enabled: bool,
    pub fetch_concurrency: usize,
    pub public_prefix: String,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Ok(Self::from_lookup(|name| std::env::var(name).ok(), &home))
    }

    pub fn from_lookup<F>(lookup: F, home: &Path) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let path = |name: &str| text(name).map(|value| expand_with_home(&value, home));

        Self {
            base_url: text("NCPHOTOS_BASE_URL"),
            account: text("NCPHOTOS_ACCOUNT"),
            folder: text("NCPHOTOS_FOLDER").unwrap_or_else(|| DEFAULT_FOLDER.to_string()),
            cache_root: path("NCPHOTOS_CACHE_DIR").unwrap_or_else(default_cache_root),
            token_file: path("NCPHOTOS_TOKEN_FILE").unwrap_or_else(|| default_token_file(home)),
            sync_interval: Duration::from_secs(read_u64(
                &lookup,
                "NCPHOTOS_SYNC_INTERVAL_SECS",
                DEFAULT_SYNC_INTERVAL_SECS,
            )),
            request_timeout: Duration::from_secs(read_u64(
                &lookup,
                "NCPHOTOS_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )),
            max_width: read_u32(&lookup, "NCPHOTOS_MAX_WIDTH", DEFAULT_MAX_WIDTH),
            max_height: read_u32(&lookup, "NCPHOTOS_MAX_HEIGHT", DEFAULT_MAX_HEIGHT),
            image_quality: read_u32(&lookup, "NCPHOTOS_IMAGE_QUALITY", DEFAULT_QUALITY),
            transform_enabled: read_bool(&lookup, "NCPHOTOS_TRANSFORM", true),
            fetch_concurrency: read_u64(
                &lookup,
                "NCPHOTOS_FETCH_CONCURRENCY",
                DEFAULT_FETCH_CONCURRENCY,
            ) as usize,
            public_prefix: text("NCPHOTOS_PUBLIC_PREFIX")
                .unwrap_or_else(|| DEFAULT_PUBLIC_PREFIX.to_string()),
        }
    }

    pub fn transform(&self) -> Option<ImageTransform> {
        self.transform_enabled
            .then(|| ImageTransform::new(self.max_width, self.max_height, self.image_quality))
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            folder: self.folder.clone(),
            cache_root: self.cache_root.clone(),
            public_prefix: self.public_prefix.clone(),
            transform: self.transform(),
            fetch_concurrency: self.fetch_concurrency,
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
}

impl DaemonRuntime {
    /// Loads credentials and wires the engine. A missing or unreadable token
    /// record is reported as an auth error before failing.
    pub async fn bootstrap(config: DaemonConfig, events: EventSender) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.cache_root)
            .await
            .with_context(|| format!("failed to create cache root at {:?}", config.cache_root))?;
        if token_file_in_cache(&config.cache_root, &config.token_file).await {
            anyhow::bail!(
                "token file {:?} is inside the cache directory {:?}, where it would be evicted",
                config.token_file,
                config.cache_root
            );
        }

        let tokens = match TokenStore::load(
            TokenFile::new(config.token_file.clone()),
            config.request_timeout,
        ) {
            Ok(tokens) => tokens,
            Err(err) => {
                let _ = events.send(SyncEvent::AuthError {
                    message: err.to_string(),
                });
                return Err(err).context("cannot start without credentials");
            }
        };

        let record = tokens.snapshot().await;
        let base_url = config.base_url.clone().unwrap_or(record.remote_base_url);
        let account = config
            .account
            .clone()
            .unwrap_or(record.account_name)
            .trim()
            .to_string();
        if account.is_empty() {
            let message = "no account name in token record; set NCPHOTOS_ACCOUNT".to_string();
            let _ = events.send(SyncEvent::AuthError {
                message: message.clone(),
            });
            anyhow::bail!(message);
        }

        let dav = DavClient::with_timeout(&base_url, account, config.request_timeout)
            .with_context(|| format!("invalid remote base url {base_url:?}"))?;
        let engine = Arc::new(SyncEngine::new(
            Arc::new(tokens),
            dav,
            config.engine_config(),
            events,
        ));

        Ok(Self { config, engine })
    }

    /// Syncs on the configured interval until Ctrl-C.
    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            folder = %self.config.folder,
            cache_root = %self.config.cache_root.display(),
            interval_secs = self.config.sync_interval.as_secs(),
            transform = self.config.transform_enabled,
            "ncphotosd started"
        );

        tokio::select! {
            _ = self.engine.run(self.config.sync_interval) => {}
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                tracing::info!("shutdown requested");
            }
        }
        Ok(())
    }

    pub async fn run_once(self) -> anyhow::Result<CycleReport> {
        self.engine
            .run_cycle()
            .await
            .context("sync cycle failed")
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
