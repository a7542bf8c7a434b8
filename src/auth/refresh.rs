// Identity provider token endpoint

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};

use super::types::TokenPayload;
use crate::error::{AuthError, Result};

/// Scope requested during the browser authorization step
const AUTHORIZE_SCOPE: &str = "openid onecta:basic.integration";

/// Mints token payloads from an authorization code or a refresh token
///
/// Implementations must not retry: a refresh request that reached the
/// provider may already have rotated the refresh token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Bootstrap: exchange a one-time authorization code
    async fn exchange(&self, code: &str) -> Result<TokenPayload>;

    /// Renewal: exchange the current refresh token
    async fn renew(&self, refresh_token: &str) -> Result<TokenPayload>;
}

/// OAuth client registration used against the provider
#[derive(Debug, Clone)]
pub struct ClientRegistration {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

/// `TokenRefresher` over HTTP
pub struct HttpRefresher {
    client: Client,
    idp_url: String,
    registration: ClientRegistration,
}

impl HttpRefresher {
    pub fn new(client: Client, idp_url: impl Into<String>, registration: ClientRegistration) -> Self {
        Self {
            client,
            idp_url: idp_url.into().trim_end_matches('/').to_string(),
            registration,
        }
    }

    fn token_url(&self) -> String {
        format!("{}/token", self.idp_url)
    }

    /// URL the user opens in a browser to obtain an authorization code
    pub fn authorize_url(&self) -> Result<Url> {
        Url::parse_with_params(
            &format!("{}/authorize", self.idp_url),
            &[
                ("response_type", "code"),
                ("scope", AUTHORIZE_SCOPE),
                ("client_id", self.registration.client_id.as_str()),
                ("redirect_uri", self.registration.redirect_uri.as_str()),
            ],
        )
        .map_err(|e| AuthError::IdentityProvider {
            status: None,
            message: format!("invalid identity provider URL {}: {}", self.idp_url, e),
        })
    }

    async fn post_grant(&self, grant: &str, form: &[(&str, &str)]) -> Result<TokenPayload> {
        let url = self.token_url();
        tracing::debug!(url = %url, grant_type = grant, "Requesting token from identity provider");

        let response = self
            .client
            .post(&url)
            .form(form)
            .send()
            .await
            .map_err(|e| AuthError::IdentityProvider {
                status: None,
                message: format!("failed to send {grant} request: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                status = status.as_u16(),
                grant_type = grant,
                body = %error_text,
                "Token request rejected"
            );
            return Err(classify_failure(status, error_text));
        }

        let payload: TokenPayload = response.json().await.map_err(|e| AuthError::IdentityProvider {
            status: Some(status.as_u16()),
            message: format!("failed to parse token response: {e}"),
        })?;

        if payload.access_token.is_empty() {
            return Err(AuthError::IdentityProvider {
                status: Some(status.as_u16()),
                message: "token response does not contain access_token".to_string(),
            });
        }

        payload
            .check_lifetime()
            .map_err(|message| AuthError::IdentityProvider {
                status: Some(status.as_u16()),
                message,
            })?;

        tracing::info!(
            grant_type = grant,
            expires_in = payload.expires_in,
            "Token issued by identity provider"
        );

        Ok(payload)
    }
}

/// Rejected grants need a new bootstrap; anything else may be retried later
fn classify_failure(status: StatusCode, body: String) -> AuthError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => AuthError::Authentication {
            status: status.as_u16(),
            message: body,
        },
        _ => AuthError::IdentityProvider {
            status: Some(status.as_u16()),
            message: body,
        },
    }
}

#[async_trait]
impl TokenRefresher for HttpRefresher {
    async fn exchange(&self, code: &str) -> Result<TokenPayload> {
        let reg = &self.registration;
        self.post_grant(
            "authorization_code",
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", reg.redirect_uri.as_str()),
                ("client_id", reg.client_id.as_str()),
                ("client_secret", reg.client_secret.as_str()),
            ],
        )
        .await
    }

    async fn renew(&self, refresh_token: &str) -> Result<TokenPayload> {
        let reg = &self.registration;
        self.post_grant(
            "refresh_token",
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", reg.client_id.as_str()),
                ("client_secret", reg.client_secret.as_str()),
            ],
        )
        .await
    }
}
