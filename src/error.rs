// Error handling module
// Defines the credential and resource-API error taxonomies

use std::time::Duration;

use thiserror::Error;

/// Errors raised while obtaining or maintaining the bearer token
#[derive(Error, Debug)]
pub enum AuthError {
    /// No backing store yet; only the authorization-code exchange can fix this
    #[error("No token store at {path}; run `onecta-auth code` to bootstrap")]
    NotBootstrapped { path: String },

    /// Backing store exists but could not be decoded
    #[error("Token store {path} is corrupt: {reason}")]
    CorruptStore { path: String, reason: String },

    /// Network or HTTP failure talking to the identity provider
    #[error("Identity provider error{}: {message}", fmt_status(.status))]
    IdentityProvider { status: Option<u16>, message: String },

    /// Grant rejected by the identity provider (expired or revoked)
    #[error("Authentication failed ({status}): {message}")]
    Authentication { status: u16, message: String },

    /// Exclusive lock not granted within the configured wait
    #[error("Timed out after {waited:?} waiting for the token store lock")]
    LockTimeout { waited: Duration },

    /// Operating-system lock failure
    #[error("Lock error: {0}")]
    Lock(String),

    /// I/O failure on the backing store
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl AuthError {
    /// True when the only remedy is repeating the bootstrap exchange
    pub fn requires_bootstrap(&self) -> bool {
        matches!(
            self,
            AuthError::NotBootstrapped { .. } | AuthError::Authentication { .. }
        )
    }
}

/// Errors from resource-API calls
#[derive(Error, Debug)]
pub enum ApiError {
    /// Could not obtain a bearer token
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Non-success response from the Onecta API
    #[error("Onecta API error: {status} - {message}")]
    Status { status: u16, message: String },

    /// Transport failure after all retries
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response body was not the expected JSON
    #[error("Unexpected response: {0}")]
    Decode(String),

    /// Missing or invalid configuration for this call
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for credential operations
pub type Result<T> = std::result::Result<T, AuthError>;
