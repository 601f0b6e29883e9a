//! cf-api: Cloud Controller client used by the staging watcher.
//!
//! ## Core Types
//!
//! - [`Application`] - Application snapshot as reported by the Cloud Controller
//! - [`LogMessage`] - A single log line from the application's log stream
//! - [`Credentials`] - Access/refresh token pair
//!
//! ## Request pipeline
//!
//! - [`CloudController`] - Raw transport seam ([`HttpCloudController`] talks HTTP + websocket)
//! - [`TokenManager`] - Renews expired credentials, at most one refresh in flight
//! - [`RetryPolicy`] - Bounded backoff for transient failures
//! - [`PlatformClient`] - Combines the three above

pub mod auth;
pub mod client;
pub mod credentials;
pub mod error;
pub mod models;
pub mod retry;
pub mod token;
pub mod transport;

pub use auth::{AuthService, DEFAULT_CLIENT_ID, UaaAuthService};
pub use client::PlatformClient;
pub use credentials::{CredentialStore, Credentials, MemoryCredentialStore};
pub use error::{ApiError, AuthError, Result};
pub use models::{AppState, Application, LogMessage, LogMessageType, PackageState};
pub use retry::{RetryAction, RetryPolicy, retry_with_backoff};
pub use token::TokenManager;
pub use transport::{
    CloudController, HttpCloudController, LogStream, build_http_client, install_rustls_provider,
};
