// Cross-process mutual exclusion for the token store
// flock(2) on the backing file; the kernel drops it when the holder exits

use std::fs::File;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{AuthError, Result};

/// Interval between non-blocking lock attempts
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Scoped lock acquisition; dropping the guard releases the lock
///
/// Not reentrant: a holder must drop its guard before acquiring again.
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    type Guard: Send;

    /// Exclusive lock for the read-check-refresh-write cycle
    async fn acquire_exclusive(&self) -> Result<Self::Guard>;

    /// Shared lock for plain reads
    async fn acquire_shared(&self) -> Result<Self::Guard>;
}

/// Advisory lock on the token file itself
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    async fn acquire(&self, arg: FlockArg) -> Result<Flock<File>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AuthError::NotBootstrapped {
                    path: self.path.display().to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let started = Instant::now();
        let mut contended = false;

        loop {
            match Flock::lock(file, arg) {
                Ok(guard) => {
                    if contended {
                        tracing::debug!(
                            waited_ms = started.elapsed().as_millis() as u64,
                            "Acquired token store lock after contention"
                        );
                    }
                    return Ok(guard);
                }
                Err((returned, Errno::EWOULDBLOCK)) => {
                    let waited = started.elapsed();
                    if waited >= self.timeout {
                        tracing::warn!(
                            path = %self.path.display(),
                            waited_ms = waited.as_millis() as u64,
                            "Gave up waiting for token store lock"
                        );
                        return Err(AuthError::LockTimeout { waited });
                    }
                    if !contended {
                        tracing::debug!(path = %self.path.display(), "Token store lock is held, waiting");
                        contended = true;
                    }
                    file = returned;
                    tokio::time::sleep(POLL_INTERVAL.min(self.timeout - waited)).await;
                }
                Err((_, errno)) => {
                    return Err(AuthError::Lock(format!("flock failed: {errno}")));
                }
            }
        }
    }
}

#[async_trait]
impl LockCoordinator for FileLock {
    type Guard = Flock<File>;

    async fn acquire_exclusive(&self) -> Result<Self::Guard> {
        self.acquire(FlockArg::LockExclusiveNonblock).await
    }

    async fn acquire_shared(&self) -> Result<Self::Guard> {
        self.acquire(FlockArg::LockSharedNonblock).await
    }
}
