//! Token-refresh-aware request execution.
//!
//! Every outbound request goes through [`TokenManager::execute`]. When the
//! platform rejects the access token the manager runs a two-step protocol:
//!
//! 1. Take the refresh lock. If the stored credentials changed since the
//!    request captured its snapshot, another request already refreshed; reuse
//!    the newer pair.
//! 2. Otherwise refresh exactly once against the identity provider and
//!    persist the new pair.
//!
//! The original request is then retried once. A second rejection is final.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::AuthService;
use crate::credentials::{CredentialStore, Credentials};
use crate::error::{ApiError, Result};

pub struct TokenManager {
    store: Arc<dyn CredentialStore>,
    auth: Arc<dyn AuthService>,
    /// Serializes refreshes so at most one is in flight.
    refresh_lock: Mutex<()>,
    refresh_count: AtomicU64,
}

impl TokenManager {
    pub fn new(store: Arc<dyn CredentialStore>, auth: Arc<dyn AuthService>) -> Self {
        Self {
            store,
            auth,
            refresh_lock: Mutex::new(()),
            refresh_count: AtomicU64::new(0),
        }
    }

    /// Number of refresh calls issued to the identity provider so far.
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Run `request` with the current credentials, refreshing them at most
    /// once if the platform reports them expired.
    pub async fn execute<T, F, Fut>(&self, request: F) -> Result<T>
    where
        F: Fn(Credentials) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let snapshot = self.store.credentials().await;

        match request(snapshot.clone()).await {
            Err(e) if e.is_auth_expired() => {
                debug!("Access token rejected, renewing credentials");
            }
            other => return other,
        }

        let renewed = self.renew(&snapshot).await?;

        match request(renewed).await {
            Err(e) if e.is_auth_expired() => {
                warn!("Request rejected again after credential renewal");
                Err(ApiError::AuthExpired)
            }
            other => other,
        }
    }

    /// Return credentials newer than `stale`, refreshing only if nobody else has.
    async fn renew(&self, stale: &Credentials) -> Result<Credentials> {
        let _guard = self.refresh_lock.lock().await;

        // Double-check after acquiring the lock (another request may have refreshed)
        let current = self.store.credentials().await;
        if current != *stale {
            debug!("Credentials were refreshed concurrently, reusing them");
            return Ok(current);
        }

        if !current.has_refresh_token() {
            warn!("No refresh token available, re-login required");
            return Err(ApiError::AuthExpired);
        }

        self.refresh_count.fetch_add(1, Ordering::SeqCst);
        let refreshed = match self.auth.refresh(&current.refresh_token).await {
            Ok(credentials) => credentials,
            Err(e) if e.requires_relogin() => {
                warn!(error = %e, "Refresh token rejected by identity provider");
                return Err(ApiError::AuthExpired);
            }
            Err(e) => return Err(ApiError::TokenRefresh(e)),
        };

        self.store.set_credentials(refreshed.clone()).await?;
        info!("Access token refreshed");

        Ok(refreshed)
    }
}
