use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tokio::sync::Mutex;

use super::clock::{Clock, SystemClock};
use super::lock::{FileLock, LockCoordinator};
use super::refresh::{HttpRefresher, TokenRefresher};
use super::store::{FileStore, TokenStore};
use super::types::{TokenRecord, SAFETY_MARGIN_SECS};
use crate::error::{AuthError, Result};

/// Per-process view of the shared credential
#[derive(Debug, Clone, PartialEq)]
pub enum CacheState {
    /// Store not read yet
    Uninitialized,
    /// Store absent when last read; behaves as an already-expired record
    NeedsBootstrap,
    /// Last record read from or written to the store
    Cached(TokenRecord),
}

impl CacheState {
    fn record(&self) -> Option<&TokenRecord> {
        match self {
            CacheState::Cached(record) => Some(record),
            _ => None,
        }
    }
}

/// Something that can hand out a bearer token for the next request
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Access token valid for at least the safety margin
    async fn bearer_token(&self) -> Result<String>;

    /// Token after a renewal that ignores the local expiry check
    async fn refreshed_bearer_token(&self) -> Result<String>;
}

/// Credential manager
/// Keeps one access token fresh for every process sharing the store,
/// with at most one renewal in flight across all of them
pub struct CredentialManager<S = FileStore, L = FileLock, R = HttpRefresher> {
    store: S,
    lock: L,
    refresher: R,
    clock: Arc<dyn Clock>,
    safety_margin: Duration,
    state: Mutex<CacheState>,
}

impl<S, L, R> CredentialManager<S, L, R>
where
    S: TokenStore,
    L: LockCoordinator,
    R: TokenRefresher,
{
    pub fn new(store: S, lock: L, refresher: R) -> Self {
        Self {
            store,
            lock,
            refresher,
            clock: Arc::new(SystemClock),
            safety_margin: Duration::seconds(SAFETY_MARGIN_SECS),
            state: Mutex::new(CacheState::Uninitialized),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    pub fn refresher(&self) -> &R {
        &self.refresher
    }

    /// Read the store once; a missing store is not an error here
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.initialize_locked(&mut state).await
    }

    async fn initialize_locked(&self, state: &mut CacheState) -> Result<()> {
        let loaded = match self.lock.acquire_shared().await {
            Ok(_guard) => self.store.load(),
            Err(e) => Err(e),
        };

        match loaded {
            Ok((payload, version)) => {
                let record = TokenRecord::new(payload, version);
                tracing::debug!(
                    issued_at = %record.issued_at.to_rfc3339(),
                    expiry = %record.expiry(self.safety_margin).to_rfc3339(),
                    "Loaded cached credential"
                );
                *state = CacheState::Cached(record);
                Ok(())
            }
            Err(AuthError::NotBootstrapped { path }) => {
                tracing::error!(
                    path = %path,
                    "Cannot load token store; the interactive authorization step is required"
                );
                *state = CacheState::NeedsBootstrap;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Current cached record, if any
    pub async fn snapshot(&self) -> CacheState {
        self.state.lock().await.clone()
    }

    /// Make sure the cached access token is usable right now
    pub async fn ensure_fresh(&self) -> Result<()> {
        self.refresh_cycle(false).await.map(|_| ())
    }

    /// Renew even if the local expiry says the token is still good,
    /// unless a peer has already written a newer fresh record
    pub async fn force_refresh(&self) -> Result<()> {
        self.refresh_cycle(true).await.map(|_| ())
    }

    /// Access token for the next outbound request
    pub async fn get_token(&self) -> Result<String> {
        self.refresh_cycle(false).await
    }

    async fn refresh_cycle(&self, force: bool) -> Result<String> {
        let mut state = self.state.lock().await;

        if *state == CacheState::Uninitialized {
            self.initialize_locked(&mut state).await?;
        }

        if !force {
            if let Some(record) = state.record() {
                if record.is_fresh(self.clock.now(), self.safety_margin) {
                    return Ok(record.access_token().to_string());
                }
            }
        }

        let record = self.reconcile_and_renew(&mut state).await?;
        Ok(record.access_token().to_string())
    }

    /// Slow path: runs entirely under the exclusive store lock
    async fn reconcile_and_renew(&self, state: &mut CacheState) -> Result<TokenRecord> {
        let _guard = self.lock.acquire_exclusive().await?;

        // Another process may have refreshed while we waited for the lock
        let (payload, version) = self.store.load()?;
        let newer = state.record().map_or(true, |cached| version > cached.issued_at);

        let current = if newer {
            let adopted = TokenRecord::new(payload, version);
            *state = CacheState::Cached(adopted.clone());
            if adopted.is_fresh(self.clock.now(), self.safety_margin) {
                tracing::info!(
                    issued_at = %version.to_rfc3339(),
                    "Adopted credential refreshed by another process"
                );
                return Ok(adopted);
            }
            adopted
        } else {
            match state.record() {
                Some(cached) => cached.clone(),
                None => TokenRecord::new(payload, version),
            }
        };

        tracing::info!("Access token expired, renewing");
        let renewed = match self.refresher.renew(&current.payload.refresh_token).await {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Token renewal failed; keeping previous credential");
                return Err(e);
            }
        };

        let version = match self.store.save(&renewed) {
            Ok(version) => version,
            Err(e) => {
                // The old refresh token is already dead; nothing usable remains
                tracing::error!(
                    error = %e,
                    location = %self.store.location(),
                    "Renewed credential could not be persisted; bootstrap may be required"
                );
                return Err(e);
            }
        };

        let record = TokenRecord::new(renewed, version);
        *state = CacheState::Cached(record.clone());
        self.check_issued_lifetime(&record)?;

        tracing::info!(
            expiry = %record.expiry(self.safety_margin).to_rfc3339(),
            "Access token renewed"
        );
        Ok(record)
    }

    fn check_issued_lifetime(&self, record: &TokenRecord) -> Result<()> {
        if record.is_fresh(self.clock.now(), self.safety_margin) {
            return Ok(());
        }
        Err(AuthError::IdentityProvider {
            status: None,
            message: format!(
                "issued token lifetime of {}s does not exceed the {}s safety margin",
                record.payload.expires_in,
                self.safety_margin.num_seconds()
            ),
        })
    }

    /// Bootstrap from an authorization code
    pub async fn exchange(&self, code: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        // Hold the lock if a store already exists; a fresh bootstrap has no peers
        let guard = match self.lock.acquire_exclusive().await {
            Ok(guard) => Some(guard),
            Err(AuthError::NotBootstrapped { .. }) => None,
            Err(e) => return Err(e),
        };

        let payload = self.refresher.exchange(code).await?;
        let version = self.store.save(&payload)?;
        drop(guard);

        let record = TokenRecord::new(payload, version);
        *state = CacheState::Cached(record.clone());
        self.check_issued_lifetime(&record)?;

        tracing::info!(
            location = %self.store.location(),
            "Stored credential from authorization code"
        );
        Ok(())
    }
}

#[async_trait]
impl<S, L, R> TokenProvider for CredentialManager<S, L, R>
where
    S: TokenStore,
    L: LockCoordinator,
    R: TokenRefresher,
{
    async fn bearer_token(&self) -> Result<String> {
        self.get_token().await
    }

    async fn refreshed_bearer_token(&self) -> Result<String> {
        self.refresh_cycle(true).await
    }
}
