// Authentication module
// Manages the shared token file, its lock and the identity provider

mod clock;
mod lock;
mod manager;
mod memory;
mod refresh;
mod store;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use lock::{FileLock, LockCoordinator};
pub use manager::{CacheState, CredentialManager, TokenProvider};
pub use memory::{MemoryLock, MemoryLockGuard, MemoryStore};
pub use refresh::{ClientRegistration, HttpRefresher, TokenRefresher};
pub use store::{FileStore, TokenStore};
pub use types::{TokenPayload, TokenRecord, Version, SAFETY_MARGIN_SECS};
