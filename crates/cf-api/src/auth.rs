//! Identity provider (UAA) token refresh.
//!
//! Exchanges a refresh token for a new access/refresh pair using the OAuth2
//! `refresh_token` grant:
//!
//! `POST {uaa}/oauth/token` with `grant_type=refresh_token`, authenticated
//! with the CLI's client credentials over HTTP basic auth.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::credentials::Credentials;
use crate::error::AuthError;

/// Client id the CLI registers with the identity provider.
pub const DEFAULT_CLIENT_ID: &str = "cf";

#[async_trait]
pub trait AuthService: Send + Sync {
    /// Exchange `refresh_token` for a fresh credential pair.
    async fn refresh(&self, refresh_token: &str) -> Result<Credentials, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OAuthErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// HTTP implementation against a UAA-compatible token endpoint.
#[derive(Debug, Clone)]
pub struct UaaAuthService {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl UaaAuthService {
    pub fn new(client: Client, uaa_endpoint: &str) -> Self {
        Self {
            client,
            token_url: format!("{}/oauth/token", uaa_endpoint.trim_end_matches('/')),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            client_secret: String::new(),
        }
    }

    /// Use non-default client credentials.
    pub fn with_client(mut self, client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self.client_secret = client_secret.into();
        self
    }

    pub fn token_url(&self) -> &str {
        &self.token_url
    }
}

#[async_trait]
impl AuthService for UaaAuthService {
    #[instrument(skip_all, fields(token_url = %self.token_url))]
    async fn refresh(&self, refresh_token: &str) -> Result<Credentials, AuthError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body: OAuthErrorBody = response.json().await.unwrap_or_default();
            let message = if body.error_description.is_empty() {
                body.error
            } else {
                body.error_description
            };

            // UAA answers 401 (invalid_token) or 400 (invalid_grant) for revoked/expired refresh tokens.
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::BAD_REQUEST => {
                    AuthError::InvalidRefreshToken { message }
                }
                _ => AuthError::Api { status, message },
            });
        }

        let body: TokenResponse = response.json().await.map_err(|e| AuthError::Decode {
            reason: e.to_string(),
        })?;

        if body.access_token.is_empty() {
            return Err(AuthError::Decode {
                reason: "empty access_token in token response".to_string(),
            });
        }

        debug!(
            rotated_refresh_token = body.refresh_token.is_some(),
            "Access token refreshed"
        );

        // Some providers do not rotate the refresh token; keep the old one then.
        Ok(Credentials {
            access_token: body.access_token,
            refresh_token: body
                .refresh_token
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| refresh_token.to_string()),
        })
    }
}
