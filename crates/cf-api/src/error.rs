use reqwest::StatusCode;
use thiserror::Error;

/// Result type used throughout the API client.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Errors returned by the identity provider while refreshing tokens.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The refresh token was rejected - interactive login required.
    #[error("refresh token rejected: {message}")]
    InvalidRefreshToken { message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("identity provider returned HTTP {status}: {message}")]
    Api { status: StatusCode, message: String },

    #[error("failed to decode token response: {reason}")]
    Decode { reason: String },
}

impl AuthError {
    /// Check if this error requires the operator to log in again.
    pub fn requires_relogin(&self) -> bool {
        matches!(self, Self::InvalidRefreshToken { .. })
    }
}

/// Errors returned by the platform client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The platform rejected the access token (HTTP 401 or equivalent).
    #[error("authentication expired")]
    AuthExpired,

    #[error("resource not found: {resource}")]
    NotFound { resource: String },

    #[error("validation failed ({code}): {message}")]
    Validation { code: String, message: String },

    #[error("request failed with HTTP {status} for {url}: {message}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        message: String,
    },

    #[error("HTTP request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// Transport-level failure not originating from reqwest (connection reset, etc.).
    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error("websocket error: {reason}")]
    WebSocket { reason: String },

    #[error("failed to decode response: {reason}")]
    Decode { reason: String },

    #[error("token refresh failed: {0}")]
    TokenRefresh(#[from] AuthError),

    #[error("failed to persist credentials: {reason}")]
    CredentialStore { reason: String },

    #[error("request cancelled")]
    Cancelled,
}

impl ApiError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub fn websocket(reason: impl Into<String>) -> Self {
        Self::WebSocket {
            reason: reason.into(),
        }
    }

    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    /// Whether this is the platform's "credentials expired" signal.
    #[inline]
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired)
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(e) => is_retryable_reqwest_error(e),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Transport { .. } | Self::WebSocket { .. } => true,
            Self::AuthExpired
            | Self::NotFound { .. }
            | Self::Validation { .. }
            | Self::Decode { .. }
            | Self::TokenRefresh(_)
            | Self::CredentialStore { .. }
            | Self::Cancelled => false,
        }
    }
}

/// Classify a reqwest error as retryable or non-retryable.
///
/// Retryable: connect, timeout, request and body read errors.
/// Non-retryable: redirect, builder and decode errors.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body()
}
