//! Error types for the staging watcher.

use std::time::Duration;

use cf_api::ApiError;
use thiserror::Error;

/// Boxed error reported by a start callback.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for setup code (configuration, logging).
pub type Result<T> = std::result::Result<T, Error>;

/// Reason reported when the platform marks staging as failed without saying why.
pub const UNKNOWN_STAGING_FAILURE: &str = "StagingError";

/// Setup errors: configuration and logging initialization.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// Terminal failure of a staging watch.
///
/// Every variant is final; the watcher has already released its log stream
/// by the time one of these reaches the caller.
#[derive(Error, Debug)]
pub enum WatchError {
    /// Credentials were rejected even after a refresh; log in again.
    #[error("authentication expired, please log in again")]
    AuthExpired,

    /// The platform reported a staging failure.
    #[error("staging failed: {reason}")]
    StagingFailed {
        /// Platform-reported reason, verbatim.
        reason: String,
        description: Option<String>,
    },

    /// The start callback returned an error.
    #[error("start command failed: {0}")]
    StartCallback(#[source] BoxError),

    /// The overall deadline elapsed before a terminal state was reached.
    #[error("timed out after {timeout:?} waiting for the application")]
    PollingTimeout { timeout: Duration },

    /// Transient platform errors persisted past the retry budget.
    #[error("polling failed: {source}")]
    PollingFailed {
        #[source]
        source: ApiError,
    },

    /// Non-transient platform error (not found, validation, ...), untouched.
    #[error(transparent)]
    Platform(ApiError),
}

impl WatchError {
    pub fn staging_failed(reason: impl Into<String>, description: Option<String>) -> Self {
        Self::StagingFailed {
            reason: reason.into(),
            description,
        }
    }

    pub fn start_callback(err: impl Into<BoxError>) -> Self {
        Self::StartCallback(err.into())
    }

    /// Check if the watch ended because the deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::PollingTimeout { .. })
    }

    /// The reported staging failure reason, if this is a staging failure.
    pub fn staging_reason(&self) -> Option<&str> {
        match self {
            Self::StagingFailed { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

impl From<ApiError> for WatchError {
    /// Classify a platform error that escaped the client's retry loop.
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::AuthExpired => Self::AuthExpired,
            err if err.is_transient() => Self::PollingFailed { source: err },
            err => Self::Platform(err),
        }
    }
}
