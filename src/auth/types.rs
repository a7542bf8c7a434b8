// Authentication types

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Seconds subtracted from the provider-declared lifetime
pub const SAFETY_MARGIN_SECS: i64 = 30;

/// Largest `expires_in` magnitude accepted from a store or the provider (100 years)
pub const MAX_EXPIRES_IN_SECS: i64 = 100 * 365 * 24 * 3600;

/// Modification time of the backing store, used as its version stamp
pub type Version = DateTime<Utc>;

/// Token payload exactly as the identity provider returns it
///
/// This is also the on-disk format. Fields we do not interpret are kept in
/// `extra` and written back untouched.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub expires_in: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenPayload {
    /// Reject lifetimes that cannot be turned into an expiry instant
    pub fn check_lifetime(&self) -> Result<(), String> {
        if self.expires_in.unsigned_abs() > MAX_EXPIRES_IN_SECS.unsigned_abs() {
            return Err(format!("expires_in of {}s is out of range", self.expires_in));
        }
        Ok(())
    }

    /// Copy with both secrets masked, for display
    pub fn redacted(&self) -> Value {
        let mut masked = self.clone();
        masked.access_token = mask(&self.access_token);
        masked.refresh_token = mask(&self.refresh_token);
        serde_json::to_value(masked).unwrap_or(Value::Null)
    }
}

impl fmt::Debug for TokenPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPayload")
            .field("access_token", &mask(&self.access_token))
            .field("refresh_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("expires_in", &self.expires_in)
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Keep the first few characters so tokens stay distinguishable in output
fn mask(token: &str) -> String {
    if token.chars().count() <= 6 {
        return "***".to_string();
    }
    let prefix: String = token.chars().take(6).collect();
    format!("{prefix}...")
}

/// A payload together with the store version it was read from or written as
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRecord {
    pub payload: TokenPayload,
    /// Store modification time when this process last read or wrote it
    pub issued_at: Version,
}

impl TokenRecord {
    pub fn new(payload: TokenPayload, issued_at: Version) -> Self {
        Self { payload, issued_at }
    }

    /// Conservative cutoff after which the access token must not be used
    ///
    /// Saturates at the representable range instead of overflowing.
    pub fn expiry(&self, margin: Duration) -> DateTime<Utc> {
        let saturated = if self.payload.expires_in >= 0 {
            DateTime::<Utc>::MAX_UTC
        } else {
            DateTime::<Utc>::MIN_UTC
        };
        Duration::try_seconds(self.payload.expires_in)
            .and_then(|lifetime| self.issued_at.checked_add_signed(lifetime))
            .and_then(|end| end.checked_sub_signed(margin))
            .unwrap_or(saturated)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now < self.expiry(margin)
    }

    pub fn access_token(&self) -> &str {
        &self.payload.access_token
    }
}
