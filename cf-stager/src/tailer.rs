//! Log tailing.
//!
//! The tailer runs as its own task for the lifetime of a watch session. It
//! forwards log messages to a [`LogSink`] until the session's cancellation
//! token fires, reconnecting with backoff when the stream drops. Logs are
//! best effort: stream failures are recorded and never end the watch.

use std::sync::Arc;

use cf_api::{ApiError, LogMessage, LogStream, PlatformClient, RetryPolicy};
use chrono::SecondsFormat;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::WatchSettings;
use crate::events::WatchEvent;

/// Destination for displayed log lines.
pub trait LogSink: Send + Sync {
    fn display(&self, message: &LogMessage);
}

/// Prints `cf logs`-style lines to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutLogSink;

impl LogSink for StdoutLogSink {
    fn display(&self, message: &LogMessage) {
        println!("{}", format_log_line(message));
    }
}

/// Forwards application logs as tracing events under the `app_logs` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn display(&self, message: &LogMessage) {
        info!(
            target: "cf_stager::app_logs",
            source = %message.source,
            instance = %message.source_instance,
            stream = message.message_type.as_str(),
            "{}",
            message.message.trim_end()
        );
    }
}

/// Render a message as `<timestamp> [<source>/<instance>] OUT|ERR <message>`.
pub fn format_log_line(message: &LogMessage) -> String {
    format!(
        "{} [{}/{}] {} {}",
        message.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        message.source,
        message.source_instance,
        message.message_type.as_str(),
        message.message.trim_end()
    )
}

/// Source allow-list. `APP` matches `APP/PROC/WEB` and friends.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    sources: Vec<String>,
}

impl LogFilter {
    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            sources: sources
                .into_iter()
                .map(|s| s.as_ref().trim().to_ascii_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn allows(&self, message: &LogMessage) -> bool {
        if self.sources.is_empty() {
            return true;
        }
        let source = message.source.to_ascii_uppercase();
        self.sources.iter().any(|allowed| {
            source == *allowed
                || source
                    .strip_prefix(allowed.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

/// What a tailer did before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TailSummary {
    pub displayed: u64,
    pub filtered: u64,
    pub reconnects: u32,
    pub last_error: Option<String>,
}

/// How a single stream connection ended.
enum StreamEnd {
    Cancelled,
    /// Server closed the stream; `received` tells whether it delivered anything.
    Closed { received: bool },
    Failed { error: ApiError, received: bool },
}

pub struct LogTailer {
    session_id: Uuid,
    client: Arc<PlatformClient>,
    sink: Arc<dyn LogSink>,
    filter: LogFilter,
    reconnect: RetryPolicy,
    events: broadcast::Sender<WatchEvent>,
}

impl LogTailer {
    pub fn new(
        session_id: Uuid,
        client: Arc<PlatformClient>,
        sink: Arc<dyn LogSink>,
        settings: &WatchSettings,
        events: broadcast::Sender<WatchEvent>,
    ) -> Self {
        Self {
            session_id,
            client,
            sink,
            filter: LogFilter::new(&settings.log_sources),
            reconnect: RetryPolicy {
                max_retries: settings.log_reconnect_attempts,
                ..settings.retry.clone()
            },
            events,
        }
    }

    /// Spawn the tailer; it runs until `cancel` fires or reconnects are exhausted.
    pub fn spawn(self, guid: String, cancel: CancellationToken) -> JoinHandle<TailSummary> {
        let span = info_span!("log_tailer", session_id = %self.session_id, app_guid = %guid);
        tokio::spawn(async move { self.run(&guid, cancel).await }.instrument(span))
    }

    pub async fn run(self, guid: &str, cancel: CancellationToken) -> TailSummary {
        let mut summary = TailSummary::default();
        let mut failures: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let end = match self.client.open_log_stream(guid, &cancel).await {
                Ok(stream) => {
                    debug!(reconnects = summary.reconnects, "Log stream opened");
                    let _ = self.events.send(WatchEvent::LogStreamOpened {
                        session_id: self.session_id,
                        reconnects: summary.reconnects,
                    });
                    self.forward(stream, &cancel, &mut summary).await
                }
                Err(ApiError::Cancelled) => StreamEnd::Cancelled,
                Err(error) => StreamEnd::Failed {
                    error,
                    received: false,
                },
            };

            let received = match end {
                StreamEnd::Cancelled => break,
                StreamEnd::Closed { received } => {
                    debug!("Log stream closed by server");
                    received
                }
                StreamEnd::Failed { error, received } => {
                    warn!(error = %error, "Log stream error");
                    let _ = self.events.send(WatchEvent::LogStreamError {
                        session_id: self.session_id,
                        error: error.to_string(),
                    });
                    summary.last_error = Some(error.to_string());
                    if !error.is_transient() {
                        break;
                    }
                    received
                }
            };

            // A connection that delivered messages resets the failure budget.
            failures = if received { 0 } else { failures + 1 };
            if failures > self.reconnect.max_retries {
                warn!(failures, "Giving up on log stream");
                break;
            }

            let delay = self.reconnect.delay_for_attempt(failures.saturating_sub(1));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            summary.reconnects += 1;
        }

        debug!(
            displayed = summary.displayed,
            reconnects = summary.reconnects,
            "Log tailer stopped"
        );
        let _ = self.events.send(WatchEvent::LogTailStopped {
            session_id: self.session_id,
            summary: summary.clone(),
        });
        summary
    }

    /// Forward messages until the stream ends or `cancel` fires.
    ///
    /// The stream is dropped on return, which releases the connection.
    async fn forward(
        &self,
        mut stream: LogStream,
        cancel: &CancellationToken,
        summary: &mut TailSummary,
    ) -> StreamEnd {
        let mut received = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    // The token may have fired while this frame was in flight.
                    if cancel.is_cancelled() {
                        return StreamEnd::Cancelled;
                    }
                    received = true;
                    if !self.filter.allows(&message) {
                        summary.filtered += 1;
                        continue;
                    }
                    self.sink.display(&message);
                    summary.displayed += 1;
                }
                Some(Err(error)) => return StreamEnd::Failed { error, received },
                None => return StreamEnd::Closed { received },
            }
        }
    }
}
