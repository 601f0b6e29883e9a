//! Credential storage abstraction.
//!
//! The token manager reads the current access/refresh pair before each
//! request and writes the refreshed pair back after a successful refresh.
//! Where the pair ultimately lives (config file, keychain, memory) is up to
//! the implementation.

use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;

/// Access/refresh token pair.
///
/// Expiry is not tracked; the platform signals it with a 401.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    #[inline]
    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .finish()
    }
}

fn redact(token: &str) -> &'static str {
    if token.is_empty() { "<empty>" } else { "<redacted>" }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Current credential pair. Never returns a partially updated pair.
    async fn credentials(&self) -> Credentials;

    /// Replace both tokens atomically and persist them.
    async fn set_credentials(&self, credentials: Credentials) -> Result<()>;
}

/// In-memory credential store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: RwLock<Credentials>,
}

impl MemoryCredentialStore {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            inner: RwLock::new(credentials),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn credentials(&self) -> Credentials {
        self.inner.read().clone()
    }

    async fn set_credentials(&self, credentials: Credentials) -> Result<()> {
        *self.inner.write() = credentials;
        Ok(())
    }
}
