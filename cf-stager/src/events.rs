//! Watch events.
//!
//! Emitted on a broadcast channel so progress displays can follow a watch
//! without being part of the state machine. Sends never block and are
//! dropped when nobody is subscribed.

use std::time::Duration;

use cf_api::{AppState, PackageState};
use uuid::Uuid;

use crate::tailer::TailSummary;

/// Events emitted by the staging watcher.
///
/// Subscribe via `StagingWatcher::subscribe()`.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// A watch call started
    WatchStarted {
        session_id: Uuid,
        app_guid: String,
        org: String,
        space: String,
        timeout: Duration,
    },
    /// One application poll completed
    Polled {
        session_id: Uuid,
        poll: u32,
        package_state: PackageState,
        state: AppState,
    },
    /// Package reached `STAGED`
    Staged { session_id: Uuid, app_guid: String },
    /// The start callback is about to run
    StartInvoked { session_id: Uuid },
    /// Application reached `STARTED` after the start callback
    Started { session_id: Uuid, app_guid: String },
    /// The platform reported a staging failure
    StagingFailed { session_id: Uuid, reason: String },
    /// The overall deadline elapsed
    TimedOut { session_id: Uuid, polls: u32 },
    /// The log stream was (re)opened
    LogStreamOpened { session_id: Uuid, reconnects: u32 },
    /// The log stream failed; the tailer may reconnect
    LogStreamError { session_id: Uuid, error: String },
    /// The log tailer exited
    LogTailStopped {
        session_id: Uuid,
        summary: TailSummary,
    },
    /// The watch call is about to return
    WatchFinished {
        session_id: Uuid,
        success: bool,
        elapsed: Duration,
    },
}

impl WatchEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            Self::WatchStarted { session_id, .. }
            | Self::Polled { session_id, .. }
            | Self::Staged { session_id, .. }
            | Self::StartInvoked { session_id }
            | Self::Started { session_id, .. }
            | Self::StagingFailed { session_id, .. }
            | Self::TimedOut { session_id, .. }
            | Self::LogStreamOpened { session_id, .. }
            | Self::LogStreamError { session_id, .. }
            | Self::LogTailStopped { session_id, .. }
            | Self::WatchFinished { session_id, .. } => *session_id,
        }
    }

    /// Whether this is the last event of a watch call.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::WatchFinished { .. })
    }
}
