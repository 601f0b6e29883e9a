//! Platform data types.
//!
//! Core structures describing applications and log messages as reported by
//! the Cloud Controller and the log stream endpoint.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Desired run state of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppState {
    #[default]
    Stopped,
    Started,
}

/// Staging state of the application's package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageState {
    #[default]
    Pending,
    Staged,
    Failed,
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("PENDING"),
            Self::Staged => f.write_str("STAGED"),
            Self::Failed => f.write_str("FAILED"),
        }
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("STOPPED"),
            Self::Started => f.write_str("STARTED"),
        }
    }
}

/// Snapshot of an application as last reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Application {
    pub guid: String,
    pub name: String,
    pub state: AppState,
    pub package_state: PackageState,
    /// Machine-readable reason, e.g. `NoAppDetectedError`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_failed_reason: Option<String>,
    /// Human-readable explanation accompanying the reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_failed_description: Option<String>,
    pub instances: u32,
    /// Memory limit in megabytes.
    pub memory: u64,
    /// Disk quota in megabytes.
    pub disk: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buildpack: Option<String>,
}

impl Application {
    /// Create a snapshot with the given identity and default state.
    pub fn new(guid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            name: name.into(),
            instances: 1,
            ..Default::default()
        }
    }

    pub fn with_package_state(mut self, package_state: PackageState) -> Self {
        self.package_state = package_state;
        self
    }

    pub fn with_state(mut self, state: AppState) -> Self {
        self.state = state;
        self
    }

    pub fn with_staging_failed_reason(mut self, reason: impl Into<String>) -> Self {
        self.staging_failed_reason = Some(reason.into());
        self
    }

    /// The platform-reported failure reason, if one is present and non-blank.
    pub fn failure_reason(&self) -> Option<&str> {
        self.staging_failed_reason
            .as_deref()
            .filter(|reason| !reason.trim().is_empty())
    }
}

/// Stream a log line was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogMessageType {
    #[serde(rename = "OUT")]
    Stdout,
    #[serde(rename = "ERR")]
    Stderr,
}

impl LogMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "OUT",
            Self::Stderr => "ERR",
        }
    }
}

/// A single application log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    /// Emitting component, e.g. `STG`, `APP/PROC/WEB`, `CELL`.
    pub source: String,
    /// Instance index of the emitting component.
    pub source_instance: String,
    pub message: String,
    pub message_type: LogMessageType,
    pub timestamp: DateTime<Utc>,
}

impl LogMessage {
    pub fn new(
        source: impl Into<String>,
        source_instance: impl Into<String>,
        message: impl Into<String>,
        message_type: LogMessageType,
    ) -> Self {
        Self {
            source: source.into(),
            source_instance: source_instance.into(),
            message: message.into(),
            message_type,
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ========== Wire formats ==========

/// Cloud Controller v2 resource envelope.
#[derive(Debug, Deserialize)]
pub(crate) struct AppResource {
    metadata: ResourceMetadata,
    entity: AppEntity,
}

#[derive(Debug, Deserialize)]
struct ResourceMetadata {
    guid: String,
}

#[derive(Debug, Deserialize)]
struct AppEntity {
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: AppState,
    #[serde(default)]
    package_state: PackageState,
    #[serde(default)]
    staging_failed_reason: Option<String>,
    #[serde(default)]
    staging_failed_description: Option<String>,
    #[serde(default)]
    instances: u32,
    #[serde(default)]
    memory: u64,
    #[serde(default)]
    disk_quota: u64,
    #[serde(default)]
    buildpack: Option<String>,
    #[serde(default)]
    detected_buildpack: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

impl From<AppResource> for Application {
    fn from(resource: AppResource) -> Self {
        let AppResource { metadata, entity } = resource;
        Self {
            guid: metadata.guid,
            name: entity.name,
            state: entity.state,
            package_state: entity.package_state,
            staging_failed_reason: non_empty(entity.staging_failed_reason),
            staging_failed_description: non_empty(entity.staging_failed_description),
            instances: entity.instances,
            memory: entity.memory,
            disk: entity.disk_quota,
            buildpack: non_empty(entity.buildpack).or(non_empty(entity.detected_buildpack)),
        }
    }
}

/// Cloud Controller error body.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct CcErrorBody {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub error_code: String,
}

/// Log stream envelope, one per websocket frame.
#[derive(Debug, Deserialize)]
pub(crate) struct LogEnvelope {
    source_type: String,
    #[serde(default)]
    source_instance: String,
    message_type: LogMessageType,
    message: String,
    /// Nanoseconds since the unix epoch.
    timestamp: i64,
}

impl From<LogEnvelope> for LogMessage {
    fn from(envelope: LogEnvelope) -> Self {
        Self {
            source: envelope.source_type,
            source_instance: envelope.source_instance,
            message: envelope.message,
            message_type: envelope.message_type,
            timestamp: Utc.timestamp_nanos(envelope.timestamp),
        }
    }
}
