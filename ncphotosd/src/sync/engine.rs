use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{StreamExt, stream};
use ncphotos_core::{DavClient, DavError};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;

use super::fetcher::{CachedPhoto, FetchError, PhotoFetcher};
use super::lister::{ListError, RemoteLister};
use super::paths::assign_local_names;
use super::reconcile::CacheReconciler;
use super::transform::ImageTransform;
use crate::events::{EventSender, SyncEvent};
use crate::token_store::{TokenError, TokenStore};

/// Forced refreshes allowed per cycle after the remote rejects a token.
pub const MAX_AUTH_RETRIES: usize = 1;

const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Listing,
    AuthRetry,
    Fetching,
    Reconciling,
    Published,
    Failed,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("token error: {0}")]
    Token(#[from] TokenError),
    #[error("remote rejected the access token again after a refresh")]
    AuthRejected,
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(DavError),
    #[error("cache error: {0}")]
    Cache(#[from] io::Error),
}

impl CycleError {
    /// Credential problems are reported to the presentation layer, everything
    /// else is only logged.
    pub fn is_auth(&self) -> bool {
        matches!(self, CycleError::Token(_) | CycleError::AuthRejected)
    }
}

#[derive(Debug, Default, Clone)]
pub struct CycleReport {
    pub photos: Vec<CachedPhoto>,
    pub failed: Vec<String>,
    pub evicted: Vec<String>,
    pub auth_retries: usize,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub folder: String,
    pub cache_root: PathBuf,
    pub public_prefix: String,
    pub transform: Option<ImageTransform>,
    pub fetch_concurrency: usize,
}

enum Attempt {
    Completed(CycleReport),
    AuthRejected,
}

pub struct SyncEngine {
    tokens: Arc<TokenStore>,
    lister: RemoteLister,
    fetcher: PhotoFetcher,
    reconciler: CacheReconciler,
    folder: String,
    fetch_concurrency: usize,
    events: EventSender,
    cycle_lock: Mutex<()>,
    phase: watch::Sender<CyclePhase>,
    published: watch::Sender<Arc<Vec<CachedPhoto>>>,
}

impl SyncEngine {
    pub fn new(
        tokens: Arc<TokenStore>,
        dav: DavClient,
        config: EngineConfig,
        events: EventSender,
    ) -> Self {
        let fetcher = PhotoFetcher::new(dav.clone(), config.cache_root.clone(), config.public_prefix)
            .with_transform(config.transform);
        let (phase, _) = watch::channel(CyclePhase::Idle);
        let (published, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            tokens,
            lister: RemoteLister::new(dav),
            fetcher,
            reconciler: CacheReconciler::new(config.cache_root),
            folder: config.folder,
            fetch_concurrency: config.fetch_concurrency.max(1),
            events,
            cycle_lock: Mutex::new(()),
            phase,
            published,
        }
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.borrow()
    }

    /// Photo set of the last cycle that reached `Published`.
    pub fn published(&self) -> Arc<Vec<CachedPhoto>> {
        self.published.borrow().clone()
    }

    /// Runs a cycle immediately, then one per `period`. A tick that arrives
    /// while a cycle is still running is skipped.
    pub async fn run(&self, period: Duration) {
        let mut ticker = tokio::time::interval(period.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            // Failures are logged and reported inside run_cycle.
            let _ = self.run_cycle().await;
        }
    }

    /// One complete sync cycle. Cycles never overlap; a concurrent caller
    /// waits for the running one to finish.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let _cycle = self.cycle_lock.lock().await;
        self.set_phase(CyclePhase::Idle);

        let result = self.attempts().await;
        match &result {
            Ok(report) => {
                self.published
                    .send_replace(Arc::new(report.photos.clone()));
                self.set_phase(CyclePhase::Published);
                tracing::info!(
                    photos = report.photos.len(),
                    failed = report.failed.len(),
                    evicted = report.evicted.len(),
                    "sync cycle published"
                );
                self.emit(SyncEvent::PhotosUpdated {
                    photos: report.photos.clone(),
                });
            }
            Err(err) => {
                self.set_phase(CyclePhase::Failed);
                if err.is_auth() {
                    tracing::error!("sync cycle failed: {err}");
                    self.emit(SyncEvent::AuthError {
                        message: err.to_string(),
                    });
                } else {
                    tracing::warn!("sync cycle failed: {err}");
                }
            }
        }
        result
    }

    async fn attempts(&self) -> Result<CycleReport, CycleError> {
        let mut token = self.tokens.valid_token().await?;
        let mut retries = 0;
        loop {
            match self.attempt(&token).await? {
                Attempt::Completed(mut report) => {
                    report.auth_retries = retries;
                    return Ok(report);
                }
                Attempt::AuthRejected if retries < MAX_AUTH_RETRIES => {
                    retries += 1;
                    self.set_phase(CyclePhase::AuthRetry);
                    tracing::warn!("remote rejected access token, forcing refresh");
                    token = self.tokens.refresh_rejected(&token).await?;
                }
                Attempt::AuthRejected => return Err(CycleError::AuthRejected),
            }
        }
    }

    async fn attempt(&self, token: &str) -> Result<Attempt, CycleError> {
        self.set_phase(CyclePhase::Listing);
        let descriptors = match self.lister.list(token, &self.folder).await {
            Ok(descriptors) => descriptors,
            Err(ListError::AuthRejected(err)) => {
                tracing::debug!("listing rejected: {err}");
                return Ok(Attempt::AuthRejected);
            }
            Err(ListError::RemoteUnavailable(err)) => {
                return Err(CycleError::RemoteUnavailable(err));
            }
        };

        self.set_phase(CyclePhase::Fetching);
        let names = assign_local_names(
            descriptors
                .iter()
                .map(|d| (d.remote_href.as_str(), d.display_name.as_str())),
            self.fetcher.transcodes(),
        );
        let outcomes: Vec<Result<CachedPhoto, FetchError>> =
            stream::iter(descriptors.iter().zip(names.iter()))
                .map(|(descriptor, name)| self.fetcher.fetch_as(token, descriptor, name))
                .buffered(self.fetch_concurrency)
                .collect()
                .await;

        let mut report = CycleReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(photo) => report.photos.push(photo),
                Err(err) if err.is_auth() => {
                    tracing::debug!("download rejected: {err}");
                    return Ok(Attempt::AuthRejected);
                }
                Err(err) => {
                    tracing::warn!("skipping photo: {err}");
                    report.failed.push(err.to_string());
                }
            }
        }

        self.set_phase(CyclePhase::Reconciling);
        let keep: HashSet<String> = report
            .photos
            .iter()
            .map(|photo| photo.local_name.clone())
            .collect();
        let reconciled = self.reconciler.reconcile(&keep).await?;
        report.evicted = reconciled.removed;
        Ok(Attempt::Completed(report))
    }

    fn set_phase(&self, phase: CyclePhase) {
        self.phase.send_replace(phase);
        tracing::debug!(?phase, "sync phase");
    }

    fn emit(&self, event: SyncEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("no event consumer attached");
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
