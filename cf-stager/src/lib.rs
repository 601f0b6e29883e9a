//! cf-stager: watches an application through staging and startup.
//!
//! [`StagingWatcher::watch_staging`] polls the platform until the package is
//! staged (and optionally started) while a [`LogTailer`] streams the
//! application's logs. Credential expiry, transient failures and timeouts are
//! handled by the `cf-api` client and classified into [`WatchError`].

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod session;
pub mod tailer;
pub mod watcher;

pub use config::{ConfigStore, EnvConfig, StaticConfigStore, WatchSettings};
pub use error::{BoxError, Error, Result, WatchError};
pub use events::WatchEvent;
pub use session::WatchSession;
pub use tailer::{LogFilter, LogSink, LogTailer, StdoutLogSink, TailSummary, TracingLogSink};
pub use watcher::{PollOutcome, StagingWatcher, StartCallback, WatchPhase, start_callback};
