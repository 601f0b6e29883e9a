//! Platform client used by the watch engine.
//!
//! Every request runs through the [`TokenManager`] and, when it fails with a
//! transient error, through [`retry_with_backoff`]. Non-transient errors are
//! returned as-is on the first occurrence.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::{ApiError, Result};
use crate::models::Application;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::token::TokenManager;
use crate::transport::{CloudController, LogStream};

pub struct PlatformClient {
    api: Arc<dyn CloudController>,
    tokens: Arc<TokenManager>,
    retry: RetryPolicy,
}

impl PlatformClient {
    pub fn new(api: Arc<dyn CloudController>, tokens: Arc<TokenManager>, retry: RetryPolicy) -> Self {
        Self { api, tokens, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Fetch the application snapshot, retrying transient failures.
    ///
    /// Cancelling `cancel` aborts the in-flight attempt and any backoff sleep.
    #[instrument(skip(self, cancel))]
    pub async fn get_application(&self, guid: &str, cancel: &CancellationToken) -> Result<Application> {
        retry_with_backoff(&self.retry, cancel, |_| async move {
            let request = self.tokens.execute(|creds| async move {
                self.api.fetch_application(&creds.access_token, guid).await
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => RetryAction::Fail(ApiError::Cancelled),
                result = request => RetryAction::classify(result),
            }
        })
        .await
    }

    /// Open the application's log stream, retrying transient connect failures.
    #[instrument(skip(self, cancel))]
    pub async fn open_log_stream(&self, guid: &str, cancel: &CancellationToken) -> Result<LogStream> {
        retry_with_backoff(&self.retry, cancel, |_| async move {
            let request = self.tokens.execute(|creds| async move {
                self.api.connect_log_stream(&creds.access_token, guid).await
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => RetryAction::Fail(ApiError::Cancelled),
                result = request => RetryAction::classify(result),
            }
        })
        .await
    }
}
