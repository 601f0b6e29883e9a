//! Per-watch session state.
//!
//! A [`WatchSession`] owns the cancellation token shared by the poll loop and
//! the log tailer, plus the tailer's task handle. Closing the session cancels
//! the tailer and waits for it to release its stream. Dropping an unclosed
//! session (early return, panic) cancels and aborts the tailer.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::tailer::TailSummary;

/// Deadline offset used when `timeout` does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

pub struct WatchSession {
    id: Uuid,
    started_at: Instant,
    timeout: Duration,
    deadline: Instant,
    cancel: CancellationToken,
    tailer: Option<JoinHandle<TailSummary>>,
}

impl WatchSession {
    /// Start a session whose deadline is `timeout` from now.
    pub fn new(timeout: Duration) -> Self {
        let started_at = Instant::now();
        let deadline = started_at
            .checked_add(timeout)
            .unwrap_or_else(|| started_at + FAR_FUTURE);
        Self {
            id: Uuid::new_v4(),
            started_at,
            timeout,
            deadline,
            cancel: CancellationToken::new(),
            tailer: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn attach_tailer(&mut self, handle: JoinHandle<TailSummary>) {
        if let Some(previous) = self.tailer.replace(handle) {
            previous.abort();
        }
    }

    /// Cancel the tailer and wait for it to finish.
    pub async fn close(mut self) -> Option<TailSummary> {
        self.cancel.cancel();
        let handle = self.tailer.take()?;
        match handle.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Log tailer task failed");
                None
            }
        }
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.tailer.take() {
            handle.abort();
        }
    }
}
