// In-memory store and lock
// Lets several managers in one process behave like cooperating processes

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::clock::Clock;
use super::lock::LockCoordinator;
use super::store::TokenStore;
use super::types::{TokenPayload, Version};
use crate::error::{AuthError, Result};

const LOCATION: &str = "memory";

#[derive(Default)]
struct Slot {
    contents: Option<String>,
    version: Option<Version>,
    saves: usize,
    fail_saves: bool,
}

/// Shared in-memory slot; clones see the same contents
///
/// Versions come from the supplied clock and are forced to increase, the
/// same guarantee `FileStore` gives for modification times.
#[derive(Clone)]
pub struct MemoryStore {
    slot: Arc<Mutex<Slot>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
            clock,
        }
    }

    /// Put raw text in the slot, as if another writer produced it
    pub fn write_raw(&self, contents: &str) -> Version {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let version = self.next_version(slot.version);
        slot.contents = Some(contents.to_string());
        slot.version = Some(version);
        version
    }

    /// Make every following `save` fail with an I/O error, or stop doing so
    pub fn fail_saves(&self, fail: bool) {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).fail_saves = fail;
    }

    /// Number of successful `save` calls
    pub fn save_count(&self) -> usize {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).saves
    }

    fn next_version(&self, previous: Option<Version>) -> Version {
        let now = self.clock.now();
        match previous {
            Some(prev) if now <= prev => prev + chrono::Duration::milliseconds(1),
            _ => now,
        }
    }
}

impl TokenStore for MemoryStore {
    fn load(&self) -> Result<(TokenPayload, Version)> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let (Some(contents), Some(version)) = (slot.contents.as_deref(), slot.version) else {
            return Err(AuthError::NotBootstrapped {
                path: LOCATION.to_string(),
            });
        };
        let corrupt = |reason: String| AuthError::CorruptStore {
            path: LOCATION.to_string(),
            reason,
        };
        let payload: TokenPayload =
            serde_json::from_str(contents).map_err(|e| corrupt(e.to_string()))?;
        payload.check_lifetime().map_err(corrupt)?;
        Ok((payload, version))
    }

    fn save(&self, payload: &TokenPayload) -> Result<Version> {
        let contents = serde_json::to_string(payload).map_err(std::io::Error::from)?;
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.fail_saves {
            return Err(std::io::Error::other("memory store is read-only").into());
        }
        let version = self.next_version(slot.version);
        slot.contents = Some(contents);
        slot.version = Some(version);
        slot.saves += 1;
        Ok(version)
    }

    fn location(&self) -> String {
        LOCATION.to_string()
    }
}

/// Guard returned by `MemoryLock`
pub enum MemoryLockGuard {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// Reader-writer lock shared between clones, with a bounded wait
#[derive(Clone)]
pub struct MemoryLock {
    inner: Arc<RwLock<()>>,
    timeout: Duration,
}

impl MemoryLock {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(())),
            timeout,
        }
    }
}

#[async_trait]
impl LockCoordinator for MemoryLock {
    type Guard = MemoryLockGuard;

    async fn acquire_exclusive(&self) -> Result<Self::Guard> {
        tokio::time::timeout(self.timeout, self.inner.clone().write_owned())
            .await
            .map(MemoryLockGuard::Exclusive)
            .map_err(|_| AuthError::LockTimeout {
                waited: self.timeout,
            })
    }

    async fn acquire_shared(&self) -> Result<Self::Guard> {
        tokio::time::timeout(self.timeout, self.inner.clone().read_owned())
            .await
            .map(MemoryLockGuard::Shared)
            .map_err(|_| AuthError::LockTimeout {
                waited: self.timeout,
            })
    }
}
