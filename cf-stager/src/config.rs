//! Watcher configuration.
//!
//! Settings come from the environment (optionally a `.env` file). The
//! [`ConfigStore`] trait is what the watcher itself depends on: the current
//! credential pair plus the overall polling timeout.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use cf_api::{CredentialStore, Credentials, MemoryCredentialStore, RetryPolicy};

use crate::error::{Error, Result};

/// Overall polling timeout used when `async_timeout` is unset or zero.
pub const DEFAULT_ASYNC_TIMEOUT_MINUTES: u64 = 15;

/// Interval between application state polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive log stream failures tolerated before the tailer gives up.
pub const DEFAULT_LOG_RECONNECT_ATTEMPTS: u32 = 5;

/// Capacity of the watch event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Per-request HTTP timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest accepted `async_timeout`, one year.
pub const MAX_ASYNC_TIMEOUT_MINUTES: u64 = 60 * 24 * 365;

/// Convert the `async_timeout` setting (minutes) into the overall polling timeout.
///
/// Values above [`MAX_ASYNC_TIMEOUT_MINUTES`] are clamped.
pub fn polling_timeout_from_minutes(minutes: u64) -> Duration {
    let minutes = match minutes {
        0 => DEFAULT_ASYNC_TIMEOUT_MINUTES,
        m => m.min(MAX_ASYNC_TIMEOUT_MINUTES),
    };
    Duration::from_secs(minutes * 60)
}

/// Trim `value`, treating blank values as unset.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Read a process environment variable; blank values count as unset.
pub fn env_var(key: &str) -> Option<String> {
    non_blank(std::env::var(key).ok())
}

/// Read a process environment variable that must be set.
pub fn required_env_var(key: &str) -> Result<String> {
    env_var(key).ok_or_else(|| missing(key))
}

fn missing(key: &str) -> Error {
    Error::config(format!("{key} must be set"))
}

/// Configuration read by the watcher on every watch call.
pub trait ConfigStore: CredentialStore {
    /// Wall-clock budget for one watch call.
    fn overall_polling_timeout(&self) -> Duration;
}

/// Tunables for polling, retrying and log tailing.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    pub log_reconnect_attempts: u32,
    /// Log sources to display (e.g. `STG`, `APP`). Empty means all.
    pub log_sources: Vec<String>,
    pub event_capacity: usize,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry: RetryPolicy::default(),
            log_reconnect_attempts: DEFAULT_LOG_RECONNECT_ATTEMPTS,
            log_sources: Vec::new(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl WatchSettings {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_log_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.log_reconnect_attempts = attempts;
        self
    }

    pub fn with_log_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.log_sources = sources.into_iter().map(Into::into).collect();
        self
    }
}

/// Configuration loaded from environment variables.
#[derive(Clone)]
pub struct EnvConfig {
    pub api_endpoint: String,
    pub uaa_endpoint: String,
    pub doppler_endpoint: String,
    pub credentials: Credentials,
    /// `CF_ASYNC_TIMEOUT`, in minutes.
    pub async_timeout: u64,
    pub skip_ssl_validation: bool,
    pub uaa_client_id: String,
    pub uaa_client_secret: String,
    pub settings: WatchSettings,
}

impl fmt::Debug for EnvConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvConfig")
            .field("api_endpoint", &self.api_endpoint)
            .field("uaa_endpoint", &self.uaa_endpoint)
            .field("doppler_endpoint", &self.doppler_endpoint)
            .field("credentials", &self.credentials)
            .field("async_timeout", &self.async_timeout)
            .field("skip_ssl_validation", &self.skip_ssl_validation)
            .field("uaa_client_id", &self.uaa_client_id)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl EnvConfig {
    /// Load configuration from the process environment.
    ///
    /// A `.env` file is not read here; load it with `dotenvy` first.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_blank(lookup(key));
        let required = |key: &str| get(key).ok_or_else(|| missing(key));

        let api_endpoint = required("CF_API")?;
        let uaa_endpoint = required("CF_UAA")?;
        let doppler_endpoint = required("CF_DOPPLER")?;
        let access_token = required("CF_ACCESS_TOKEN")?;
        let refresh_token = get("CF_REFRESH_TOKEN").unwrap_or_default();

        let async_timeout = parse_or("CF_ASYNC_TIMEOUT", get("CF_ASYNC_TIMEOUT"), 0u64)?;
        if async_timeout > MAX_ASYNC_TIMEOUT_MINUTES {
            return Err(Error::config(format!(
                "CF_ASYNC_TIMEOUT must be at most {MAX_ASYNC_TIMEOUT_MINUTES} minutes, got {async_timeout}"
            )));
        }
        let skip_ssl_validation = parse_bool("CF_SKIP_SSL_VALIDATION", get("CF_SKIP_SSL_VALIDATION"))?;

        let mut settings = WatchSettings::default();
        if let Some(ms) = get("CF_POLL_INTERVAL_MS") {
            let ms: u64 = parse("CF_POLL_INTERVAL_MS", &ms)?;
            if ms == 0 {
                return Err(Error::config("CF_POLL_INTERVAL_MS must be greater than zero"));
            }
            settings.poll_interval = Duration::from_millis(ms);
        }
        if let Some(retries) = get("CF_MAX_RETRIES") {
            settings.retry.max_retries = parse("CF_MAX_RETRIES", &retries)?;
        }
        if let Some(sources) = get("CF_LOG_SOURCES") {
            settings.log_sources = sources
                .split(',')
                .map(|s| s.trim().to_ascii_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }

        Ok(Self {
            api_endpoint,
            uaa_endpoint,
            doppler_endpoint,
            credentials: Credentials::new(access_token, refresh_token),
            async_timeout,
            skip_ssl_validation,
            uaa_client_id: get("CF_UAA_CLIENT_ID").unwrap_or_else(|| cf_api::DEFAULT_CLIENT_ID.to_string()),
            uaa_client_secret: get("CF_UAA_CLIENT_SECRET").unwrap_or_default(),
            settings,
        })
    }

    pub fn overall_polling_timeout(&self) -> Duration {
        polling_timeout_from_minutes(self.async_timeout)
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::config(format!("Invalid {key} '{value}': {e}")))
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value.map_or(Ok(default), |v| parse(key, &v))
}

fn parse_bool(key: &str, value: Option<String>) -> Result<bool> {
    match value.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(Error::config(format!("Invalid {key} '{other}': expected a boolean"))),
    }
}

/// In-memory [`ConfigStore`].
///
/// Refreshed credentials live for the lifetime of the process only.
#[derive(Debug)]
pub struct StaticConfigStore {
    credentials: MemoryCredentialStore,
    async_timeout: u64,
}

impl StaticConfigStore {
    pub fn new(credentials: Credentials, async_timeout: u64) -> Self {
        Self {
            credentials: MemoryCredentialStore::new(credentials),
            async_timeout,
        }
    }

    pub fn from_env_config(config: &EnvConfig) -> Self {
        Self::new(config.credentials.clone(), config.async_timeout)
    }
}

#[async_trait]
impl CredentialStore for StaticConfigStore {
    async fn credentials(&self) -> Credentials {
        self.credentials.credentials().await
    }

    async fn set_credentials(&self, credentials: Credentials) -> cf_api::Result<()> {
        self.credentials.set_credentials(credentials).await
    }
}

impl ConfigStore for StaticConfigStore {
    fn overall_polling_timeout(&self) -> Duration {
        polling_timeout_from_minutes(self.async_timeout)
    }
}
