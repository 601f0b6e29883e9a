//! End-to-end watch scenarios against a scripted platform.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cf_api::{
    ApiError, AppState, Application, AuthError, AuthService, CloudController, CredentialStore,
    Credentials, LogMessage, LogMessageType, LogStream, MemoryCredentialStore, PackageState,
    PlatformClient, RetryPolicy, TokenManager,
};
use cf_stager::error::UNKNOWN_STAGING_FAILURE;
use cf_stager::{
    BoxError, ConfigStore, LogSink, StagingWatcher, WatchError, WatchEvent, WatchSettings,
    start_callback,
};
use futures::StreamExt;
use parking_lot::Mutex;

/// Flips the flag when the log stream holding it is dropped.
struct ReleaseGuard(Arc<AtomicBool>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Scripted platform: replays poll results in order, then repeats the last snapshot.
struct FakePlatform {
    polls: Mutex<VecDeque<cf_api::Result<Application>>>,
    last: Mutex<Option<Application>>,
    poll_count: AtomicU32,
    rejected_token: Option<String>,
    tokens_seen: Mutex<Vec<String>>,
    log_lines: Vec<LogMessage>,
    streams_opened: AtomicU32,
    stream_released: Arc<AtomicBool>,
}

impl FakePlatform {
    fn new(polls: Vec<cf_api::Result<Application>>) -> Self {
        Self {
            polls: Mutex::new(polls.into()),
            last: Mutex::new(None),
            poll_count: AtomicU32::new(0),
            rejected_token: None,
            tokens_seen: Mutex::new(Vec::new()),
            log_lines: Vec::new(),
            streams_opened: AtomicU32::new(0),
            stream_released: Arc::new(AtomicBool::new(false)),
        }
    }

    fn rejecting(mut self, token: &str) -> Self {
        self.rejected_token = Some(token.to_string());
        self
    }

    fn with_logs(mut self, lines: Vec<LogMessage>) -> Self {
        self.log_lines = lines;
        self
    }

    fn polls(&self) -> u32 {
        self.poll_count.load(Ordering::SeqCst)
    }

    fn stream_released(&self) -> bool {
        self.stream_released.load(Ordering::SeqCst)
    }

    /// No log stream is still open (either never opened or released).
    fn no_live_stream(&self) -> bool {
        self.streams_opened.load(Ordering::SeqCst) == 0 || self.stream_released()
    }

    fn check_token(&self, access_token: &str) -> cf_api::Result<()> {
        if self.rejected_token.as_deref() == Some(access_token) {
            return Err(ApiError::AuthExpired);
        }
        Ok(())
    }
}

#[async_trait]
impl CloudController for FakePlatform {
    async fn fetch_application(&self, access_token: &str, _guid: &str) -> cf_api::Result<Application> {
        self.tokens_seen.lock().push(access_token.to_string());
        self.check_token(access_token)?;
        self.poll_count.fetch_add(1, Ordering::SeqCst);

        let next = self.polls.lock().pop_front();
        match next {
            Some(Ok(app)) => {
                *self.last.lock() = Some(app.clone());
                Ok(app)
            }
            Some(Err(e)) => Err(e),
            None => self
                .last
                .lock()
                .clone()
                .ok_or_else(|| ApiError::transport("script exhausted")),
        }
    }

    async fn connect_log_stream(&self, access_token: &str, _guid: &str) -> cf_api::Result<LogStream> {
        self.check_token(access_token)?;
        self.streams_opened.fetch_add(1, Ordering::SeqCst);

        let guard = ReleaseGuard(self.stream_released.clone());
        let lines = self.log_lines.clone();
        Ok(futures::stream::iter(lines.into_iter().map(Ok))
            .chain(futures::stream::pending())
            .map(move |item| {
                let _ = &guard;
                item
            })
            .boxed())
    }
}

struct CountingAuth {
    calls: AtomicU32,
}

#[async_trait]
impl AuthService for CountingAuth {
    async fn refresh(&self, _refresh_token: &str) -> Result<Credentials, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Credentials::new("fresh", "refresh-2"))
    }
}

/// Config store with an arbitrary (sub-minute) timeout.
struct TestConfig {
    credentials: MemoryCredentialStore,
    timeout: Duration,
}

#[async_trait]
impl CredentialStore for TestConfig {
    async fn credentials(&self) -> Credentials {
        self.credentials.credentials().await
    }

    async fn set_credentials(&self, credentials: Credentials) -> cf_api::Result<()> {
        self.credentials.set_credentials(credentials).await
    }
}

impl ConfigStore for TestConfig {
    fn overall_polling_timeout(&self) -> Duration {
        self.timeout
    }
}

#[derive(Default)]
struct CollectingSink {
    lines: Mutex<Vec<String>>,
}

impl LogSink for CollectingSink {
    fn display(&self, message: &LogMessage) {
        self.lines.lock().push(message.message.clone());
    }
}

struct Harness {
    platform: Arc<FakePlatform>,
    auth: Arc<CountingAuth>,
    config: Arc<TestConfig>,
    sink: Arc<CollectingSink>,
    watcher: StagingWatcher,
}

fn settings() -> WatchSettings {
    WatchSettings::default()
        .with_poll_interval(Duration::from_secs(1))
        .with_retry(RetryPolicy::fixed(2, Duration::from_millis(1)))
        .with_log_reconnect_attempts(0)
}

fn harness(platform: FakePlatform, timeout: Duration, settings: WatchSettings) -> Harness {
    harness_with_credentials(platform, Credentials::new("stale", "refresh-1"), timeout, settings)
}

fn harness_with_credentials(
    platform: FakePlatform,
    credentials: Credentials,
    timeout: Duration,
    settings: WatchSettings,
) -> Harness {
    let platform = Arc::new(platform);
    let auth = Arc::new(CountingAuth {
        calls: AtomicU32::new(0),
    });
    let config = Arc::new(TestConfig {
        credentials: MemoryCredentialStore::new(credentials),
        timeout,
    });
    let tokens = Arc::new(TokenManager::new(config.clone(), auth.clone()));
    let client = Arc::new(PlatformClient::new(
        platform.clone(),
        tokens,
        settings.retry.clone(),
    ));
    let sink = Arc::new(CollectingSink::default());
    let watcher = StagingWatcher::new(client, config.clone(), sink.clone(), settings);

    Harness {
        platform,
        auth,
        config,
        sink,
        watcher,
    }
}

fn app() -> Application {
    Application::new("app-guid", "my-app")
}

fn pending() -> cf_api::Result<Application> {
    Ok(app())
}

fn staged() -> cf_api::Result<Application> {
    Ok(app().with_package_state(PackageState::Staged))
}

const TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[tokio::test(start_paused = true)]
async fn pending_pending_staged_returns_snapshot_after_three_polls() {
    let h = harness(
        FakePlatform::new(vec![pending(), pending(), staged()]),
        TIMEOUT,
        settings(),
    );

    let result = h.watcher.watch_staging(&app(), "org", "space", None).await;

    let staged = result.unwrap();
    assert_eq!(staged.package_state, PackageState::Staged);
    assert_eq!(h.platform.polls(), 3);
    assert_eq!(h.platform.streams_opened.load(Ordering::SeqCst), 1);
    assert!(h.platform.stream_released());
}

#[tokio::test(start_paused = true)]
async fn staged_with_reason_is_staging_failure() {
    let h = harness(
        FakePlatform::new(vec![Ok(app()
            .with_package_state(PackageState::Staged)
            .with_staging_failed_reason("buildpack not found"))]),
        TIMEOUT,
        settings(),
    );

    let result = h.watcher.watch_staging(&app(), "org", "space", None).await;

    match result {
        Err(WatchError::StagingFailed { reason, .. }) => assert_eq!(reason, "buildpack not found"),
        other => panic!("expected staging failure, got {other:?}"),
    }
    assert_eq!(h.platform.polls(), 1);
    assert!(h.platform.no_live_stream());
}

#[tokio::test(start_paused = true)]
async fn failed_package_reports_platform_reason_and_stops_polling() {
    let mut failed = app()
        .with_package_state(PackageState::Failed)
        .with_staging_failed_reason("NoAppDetectedError");
    failed.staging_failed_description = Some("An app was not successfully detected".to_string());
    let h = harness(
        FakePlatform::new(vec![pending(), Ok(failed)]),
        TIMEOUT,
        settings(),
    );

    let result = h.watcher.watch_staging(&app(), "org", "space", None).await;

    match result {
        Err(WatchError::StagingFailed {
            reason,
            description,
        }) => {
            assert_eq!(reason, "NoAppDetectedError");
            assert_eq!(
                description.as_deref(),
                Some("An app was not successfully detected")
            );
        }
        other => panic!("expected staging failure, got {other:?}"),
    }
    assert_eq!(h.platform.polls(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_package_without_reason_is_generic_failure() {
    let h = harness(
        FakePlatform::new(vec![Ok(app().with_package_state(PackageState::Failed))]),
        TIMEOUT,
        settings(),
    );

    let err = h
        .watcher
        .watch_staging(&app(), "org", "space", None)
        .await
        .unwrap_err();

    assert_eq!(err.staging_reason(), Some(UNKNOWN_STAGING_FAILURE));
}

#[tokio::test(start_paused = true)]
async fn start_callback_error_ends_watch() {
    let h = harness(FakePlatform::new(vec![staged()]), TIMEOUT, settings());
    let invoked = Arc::new(AtomicU32::new(0));
    let counter = invoked.clone();

    let callback = start_callback(move |_staged| async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(BoxError::from("crash"))
    });
    let result = h
        .watcher
        .watch_staging(&app(), "org", "space", Some(callback))
        .await;

    match result {
        Err(err @ WatchError::StartCallback(_)) => assert!(err.to_string().contains("crash")),
        other => panic!("expected start callback error, got {other:?}"),
    }
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert_eq!(h.platform.polls(), 1);
    assert!(h.platform.no_live_stream());
}

#[tokio::test(start_paused = true)]
async fn start_callback_then_polls_until_started() {
    let stopped = app().with_package_state(PackageState::Staged);
    let started = stopped.clone().with_state(AppState::Started);
    let h = harness(
        FakePlatform::new(vec![staged(), Ok(stopped), Ok(started)]),
        TIMEOUT,
        settings(),
    );
    let invoked = Arc::new(AtomicU32::new(0));
    let counter = invoked.clone();

    let callback = start_callback(move |staged: Application| async move {
        counter.fetch_add(1, Ordering::SeqCst);
        assert_eq!(staged.package_state, PackageState::Staged);
        Ok(staged)
    });
    let result = h
        .watcher
        .watch_staging(&app(), "org", "space", Some(callback))
        .await
        .unwrap();

    assert_eq!(result.state, AppState::Started);
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert_eq!(h.platform.polls(), 3);
}

#[tokio::test(start_paused = true)]
async fn all_pending_times_out_after_two_polls() {
    let h = harness(
        FakePlatform::new(vec![pending()]),
        Duration::from_millis(20),
        settings().with_poll_interval(Duration::from_millis(10)),
    );

    let result = h.watcher.watch_staging(&app(), "org", "space", None).await;

    match result {
        Err(err @ WatchError::PollingTimeout { .. }) => assert!(err.is_timeout()),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(h.platform.polls(), 2);
    assert!(h.platform.stream_released());
}

#[tokio::test(start_paused = true)]
async fn start_phase_uses_remaining_budget() {
    let staged_app = app().with_package_state(PackageState::Staged);
    let h = harness(
        FakePlatform::new(vec![staged()]),
        Duration::from_secs(10),
        settings(),
    );

    // The callback eats 8 of the 10 seconds; the app never starts.
    let callback = start_callback(move |_| async move {
        tokio::time::sleep(Duration::from_secs(8)).await;
        Ok(staged_app)
    });
    let started_at = tokio::time::Instant::now();
    let result = h
        .watcher
        .watch_staging(&app(), "org", "space", Some(callback))
        .await;

    assert!(matches!(result, Err(WatchError::PollingTimeout { .. })));
    assert_eq!(started_at.elapsed(), Duration::from_secs(10));
    // One staging poll plus polls at 8s and 9s.
    assert_eq!(h.platform.polls(), 3);
}

#[tokio::test(start_paused = true)]
async fn expired_token_is_refreshed_once_mid_watch() {
    let h = harness(
        FakePlatform::new(vec![pending(), staged()]).rejecting("stale"),
        TIMEOUT,
        settings(),
    );

    let result = h.watcher.watch_staging(&app(), "org", "space", None).await;

    assert!(result.is_ok());
    // One refresh serves both the poll loop and the log tailer.
    assert_eq!(h.auth.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.config.credentials().await,
        Credentials::new("fresh", "refresh-2")
    );
    let seen = h.platform.tokens_seen.lock().clone();
    assert_eq!(seen.first().map(String::as_str), Some("stale"));
    assert!(seen[1..].iter().all(|t| t == "fresh"));
}

#[tokio::test(start_paused = true)]
async fn missing_refresh_token_surfaces_auth_expired() {
    let h = harness_with_credentials(
        FakePlatform::new(vec![staged()]).rejecting("stale"),
        Credentials::new("stale", ""),
        TIMEOUT,
        settings(),
    );

    let result = h.watcher.watch_staging(&app(), "org", "space", None).await;

    assert!(matches!(result, Err(WatchError::AuthExpired)));
    assert_eq!(h.auth.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn not_found_is_surfaced_untouched() {
    let h = harness(
        FakePlatform::new(vec![Err(ApiError::not_found("app-guid"))]),
        TIMEOUT,
        settings(),
    );

    let result = h.watcher.watch_staging(&app(), "org", "space", None).await;

    assert!(matches!(
        result,
        Err(WatchError::Platform(ApiError::NotFound { .. }))
    ));
    assert_eq!(h.platform.polls(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_transient_errors_become_polling_failure() {
    let h = harness(
        FakePlatform::new(vec![
            Err(ApiError::transport("reset 1")),
            Err(ApiError::transport("reset 2")),
            Err(ApiError::transport("reset 3")),
        ]),
        TIMEOUT,
        settings(),
    );

    let result = h.watcher.watch_staging(&app(), "org", "space", None).await;

    match result {
        Err(WatchError::PollingFailed { source }) => {
            assert!(source.is_transient());
            assert!(source.to_string().contains("reset 3"));
        }
        other => panic!("expected polling failure, got {other:?}"),
    }
    // Initial attempt + 2 retries
    assert_eq!(h.platform.polls(), 3);
}

#[tokio::test(start_paused = true)]
async fn transient_error_recovers_within_retry_budget() {
    let h = harness(
        FakePlatform::new(vec![pending(), Err(ApiError::transport("reset")), staged()]),
        TIMEOUT,
        settings(),
    );

    let result = h.watcher.watch_staging(&app(), "org", "space", None).await;

    assert!(result.is_ok());
    assert_eq!(h.platform.polls(), 3);
}

#[tokio::test(start_paused = true)]
async fn logs_are_displayed_while_polling() {
    let lines = vec![
        LogMessage::new("STG", "0", "Downloading buildpack", LogMessageType::Stdout),
        LogMessage::new("RTR", "0", "GET /", LogMessageType::Stdout),
    ];
    let h = harness(
        FakePlatform::new(vec![pending(), pending(), staged()]).with_logs(lines),
        TIMEOUT,
        settings().with_log_sources(["STG"]),
    );

    h.watcher
        .watch_staging(&app(), "org", "space", None)
        .await
        .unwrap();

    assert_eq!(*h.sink.lines.lock(), vec!["Downloading buildpack"]);
    assert_eq!(h.platform.streams_opened.load(Ordering::SeqCst), 1);
    assert!(h.platform.stream_released());
}

#[tokio::test(start_paused = true)]
async fn events_bracket_the_watch() {
    let h = harness(
        FakePlatform::new(vec![pending(), staged()]),
        TIMEOUT,
        settings(),
    );
    let mut rx = h.watcher.subscribe();

    h.watcher
        .watch_staging(&app(), "org", "space", None)
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert!(matches!(events.first(), Some(WatchEvent::WatchStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(WatchEvent::WatchFinished { success: true, .. })
    ));
    let session_id = events[0].session_id();
    assert!(events.iter().all(|e| e.session_id() == session_id));

    let polled = events
        .iter()
        .filter(|e| matches!(e, WatchEvent::Polled { .. }))
        .count();
    assert_eq!(polled, 2);

    let staged_at = events
        .iter()
        .position(|e| matches!(e, WatchEvent::Staged { .. }))
        .unwrap();
    let tail_stopped_at = events
        .iter()
        .position(|e| matches!(e, WatchEvent::LogTailStopped { .. }))
        .unwrap();
    assert!(staged_at < tail_stopped_at);
}
