// Single-slot token storage
// The backing file's modification time doubles as its version stamp

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::types::{TokenPayload, Version};
use crate::error::{AuthError, Result};

/// Durable storage for the current token payload
///
/// `save` callers must hold the exclusive lock for the whole
/// read-check-write cycle; the store itself does no locking.
pub trait TokenStore: Send + Sync {
    /// Read and decode the payload, returning it with the current version
    fn load(&self) -> Result<(TokenPayload, Version)>;

    /// Overwrite the payload in place, returning the new version
    fn save(&self, payload: &TokenPayload) -> Result<Version>;

    /// Human-readable location, for diagnostics
    fn location(&self) -> String;
}

/// JSON file store
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, reason: impl ToString) -> AuthError {
        AuthError::CorruptStore {
            path: self.location(),
            reason: reason.to_string(),
        }
    }
}

impl TokenStore for FileStore {
    fn load(&self) -> Result<(TokenPayload, Version)> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AuthError::NotBootstrapped {
                    path: self.location(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        // Stat the same descriptor we read from
        let modified = file.metadata()?.modified()?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let payload: TokenPayload =
            serde_json::from_str(&contents).map_err(|e| self.corrupt(e))?;
        payload.check_lifetime().map_err(|e| self.corrupt(e))?;

        tracing::debug!(
            path = %self.path.display(),
            version = %DateTime::<Utc>::from(modified).to_rfc3339(),
            "Loaded token store"
        );

        Ok((payload, modified.into()))
    }

    fn save(&self, payload: &TokenPayload) -> Result<Version> {
        let mut json = serde_json::to_string_pretty(payload).map_err(std::io::Error::from)?;
        json.push('\n');

        let previous = fs::metadata(&self.path).and_then(|m| m.modified()).ok();

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.path)?;
        file.write_all(json.as_bytes())?;
        file.sync_data()?;

        let mut modified = file.metadata()?.modified()?;

        // Coarse filesystem timestamps can repeat within one tick; the
        // version must still move forward or peers will miss this write
        if let Some(previous) = previous {
            if modified <= previous {
                modified = previous + Duration::from_millis(1);
                file.set_modified(modified)?;
            }
        }

        tracing::debug!(
            path = %self.path.display(),
            version = %DateTime::<Utc>::from(modified).to_rfc3339(),
            "Saved token store"
        );

        Ok(modified.into())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}
