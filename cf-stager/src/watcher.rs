//! Staging watcher.
//!
//! Polls the application until its package is staged (and, when a start
//! callback is given, until the application is started), while a
//! [`LogTailer`] streams its logs. Every exit path closes the session, so the
//! log stream is released before [`StagingWatcher::watch_staging`] returns.
//!
//! ```text
//! Staging --STAGED--> [start callback] --> Starting --STARTED--> done
//!    |                      |                  |
//!    +--FAILED / reason-----+--callback error--+--> error
//!    +--deadline elapsed--------------------------> PollingTimeout
//! ```

use std::future::Future;
use std::sync::Arc;

use cf_api::{ApiError, AppState, Application, PackageState, PlatformClient};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigStore, WatchSettings};
use crate::error::{BoxError, UNKNOWN_STAGING_FAILURE, WatchError};
use crate::events::WatchEvent;
use crate::session::WatchSession;
use crate::tailer::{LogSink, LogTailer};

/// Single-shot callback invoked once the package is staged.
///
/// Receives the staged snapshot and returns the application to watch until
/// it is started.
pub type StartCallback =
    Box<dyn FnOnce(Application) -> BoxFuture<'static, Result<Application, BoxError>> + Send>;

/// Box an async closure as a [`StartCallback`].
pub fn start_callback<F, Fut>(f: F) -> StartCallback
where
    F: FnOnce(Application) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Application, BoxError>> + Send + 'static,
{
    Box::new(move |app| f(app).boxed())
}

/// Which field the poll loop is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    /// Waiting for `package_state` to leave `PENDING`.
    Staging,
    /// Waiting for `state` to become `STARTED` after the start callback.
    Starting,
}

/// Classified result of one poll.
#[derive(Debug)]
pub enum PollOutcome {
    Continue,
    Terminal(Application),
    Failed {
        reason: String,
        description: Option<String>,
    },
    TransientError(ApiError),
}

impl PollOutcome {
    /// Classify a poll result for the given phase.
    ///
    /// Non-transient platform errors are returned as `Err` untouched. A
    /// failure reason wins over whatever the state fields say.
    pub fn classify(
        phase: WatchPhase,
        result: cf_api::Result<Application>,
    ) -> Result<Self, WatchError> {
        let app = match result {
            Ok(app) => app,
            Err(e) if e.is_transient() => return Ok(Self::TransientError(e)),
            Err(e) => return Err(e.into()),
        };

        if let Some(reason) = app.failure_reason() {
            return Ok(Self::Failed {
                reason: reason.to_string(),
                description: app.staging_failed_description.clone(),
            });
        }

        Ok(match (phase, app.package_state) {
            (_, PackageState::Failed) => Self::Failed {
                reason: UNKNOWN_STAGING_FAILURE.to_string(),
                description: app.staging_failed_description.clone(),
            },
            (WatchPhase::Staging, PackageState::Staged) => Self::Terminal(app),
            (WatchPhase::Staging, PackageState::Pending) => Self::Continue,
            (WatchPhase::Starting, _) if app.state == AppState::Started => Self::Terminal(app),
            (WatchPhase::Starting, _) => Self::Continue,
        })
    }
}

pub struct StagingWatcher {
    client: Arc<PlatformClient>,
    config: Arc<dyn ConfigStore>,
    sink: Arc<dyn LogSink>,
    settings: WatchSettings,
    events: broadcast::Sender<WatchEvent>,
}

impl StagingWatcher {
    pub fn new(
        client: Arc<PlatformClient>,
        config: Arc<dyn ConfigStore>,
        sink: Arc<dyn LogSink>,
        settings: WatchSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            client,
            config,
            sink,
            settings,
            events,
        }
    }

    /// Subscribe to watch events.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &WatchSettings {
        &self.settings
    }

    fn emit(&self, event: WatchEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Watch `app` until it is staged (and started, if `start` is given).
    ///
    /// Returns exactly once with the final snapshot or a [`WatchError`]. The
    /// log tailer has been cancelled and joined by the time this returns.
    #[instrument(skip_all, fields(app = %app.name, guid = %app.guid, org = %org, space = %space))]
    pub async fn watch_staging(
        &self,
        app: &Application,
        org: &str,
        space: &str,
        start: Option<StartCallback>,
    ) -> Result<Application, WatchError> {
        let timeout = self.config.overall_polling_timeout();
        let mut session = WatchSession::new(timeout);
        let session_id = session.id();

        info!(%session_id, timeout_secs = timeout.as_secs(), "Waiting for app to stage");
        self.emit(WatchEvent::WatchStarted {
            session_id,
            app_guid: app.guid.clone(),
            org: org.to_string(),
            space: space.to_string(),
            timeout,
        });

        let tailer = LogTailer::new(
            session_id,
            self.client.clone(),
            self.sink.clone(),
            &self.settings,
            self.events.clone(),
        );
        session.attach_tailer(tailer.spawn(app.guid.clone(), session.cancel_token().clone()));

        let result = self.poll_until_terminal(&session, app, start).await;
        let elapsed = session.elapsed();

        if let Some(summary) = session.close().await {
            debug!(
                displayed = summary.displayed,
                reconnects = summary.reconnects,
                "Log tail closed"
            );
        }

        match &result {
            Ok(app) => info!(state = %app.state, package_state = %app.package_state, "Watch finished"),
            Err(e) => warn!(error = %e, "Watch failed"),
        }
        self.emit(WatchEvent::WatchFinished {
            session_id,
            success: result.is_ok(),
            elapsed,
        });

        result
    }

    async fn poll_until_terminal(
        &self,
        session: &WatchSession,
        app: &Application,
        mut start: Option<StartCallback>,
    ) -> Result<Application, WatchError> {
        let session_id = session.id();
        let deadline = session.deadline();
        let mut guid = app.guid.clone();
        let mut phase = WatchPhase::Staging;
        let mut polls: u32 = 0;

        loop {
            if session.is_expired() {
                return Err(self.timed_out(session, polls));
            }

            // The deadline also bounds the client's retry loop.
            let result = match tokio::time::timeout_at(
                deadline,
                self.client.get_application(&guid, session.cancel_token()),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => return Err(self.timed_out(session, polls)),
            };
            polls += 1;

            if let Ok(snapshot) = &result {
                debug!(
                    poll = polls,
                    package_state = %snapshot.package_state,
                    state = %snapshot.state,
                    "Polled application"
                );
                self.emit(WatchEvent::Polled {
                    session_id,
                    poll: polls,
                    package_state: snapshot.package_state,
                    state: snapshot.state,
                });
            }

            match PollOutcome::classify(phase, result)? {
                PollOutcome::Continue => {}
                PollOutcome::Failed {
                    reason,
                    description,
                } => {
                    warn!(%reason, "Staging failed");
                    self.emit(WatchEvent::StagingFailed {
                        session_id,
                        reason: reason.clone(),
                    });
                    return Err(WatchError::staging_failed(reason, description));
                }
                PollOutcome::TransientError(e) => {
                    // The client already spent its retry budget on this poll.
                    return Err(WatchError::PollingFailed { source: e });
                }
                PollOutcome::Terminal(snapshot) if phase == WatchPhase::Starting => {
                    info!("App started");
                    self.emit(WatchEvent::Started {
                        session_id,
                        app_guid: snapshot.guid.clone(),
                    });
                    return Ok(snapshot);
                }
                PollOutcome::Terminal(snapshot) => {
                    info!("App staged");
                    self.emit(WatchEvent::Staged {
                        session_id,
                        app_guid: snapshot.guid.clone(),
                    });

                    let Some(callback) = start.take() else {
                        return Ok(snapshot);
                    };

                    self.emit(WatchEvent::StartInvoked { session_id });
                    let started = match tokio::time::timeout_at(deadline, callback(snapshot)).await {
                        Ok(Ok(started)) => started,
                        Ok(Err(e)) => return Err(WatchError::StartCallback(e)),
                        Err(_) => return Err(self.timed_out(session, polls)),
                    };

                    if !started.guid.is_empty() {
                        guid = started.guid;
                    }
                    phase = WatchPhase::Starting;
                    debug!(remaining_ms = session.remaining().as_millis() as u64, "Waiting for app to start");
                    // Poll right away against whatever budget is left.
                    continue;
                }
            }

            let wake = (Instant::now() + self.settings.poll_interval).min(deadline);
            tokio::time::sleep_until(wake).await;
        }
    }

    fn timed_out(&self, session: &WatchSession, polls: u32) -> WatchError {
        warn!(polls, timeout_secs = session.timeout().as_secs(), "Timed out waiting for app");
        self.emit(WatchEvent::TimedOut {
            session_id: session.id(),
            polls,
        });
        WatchError::PollingTimeout {
            timeout: session.timeout(),
        }
    }
}
