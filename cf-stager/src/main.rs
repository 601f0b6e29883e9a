use std::process;
use std::sync::Arc;

use cf_api::{
    Application, HttpCloudController, PlatformClient, TokenManager, UaaAuthService,
    build_http_client,
};
use cf_stager::config::{DEFAULT_REQUEST_TIMEOUT, env_var, required_env_var};
use cf_stager::logging::{LoggingOptions, init_logging};
use cf_stager::{EnvConfig, StagingWatcher, StaticConfigStore, StdoutLogSink};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Application error: {:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    // Load .env before anything reads the environment
    dotenvy::dotenv().ok();

    let _log_guard = init_logging(&LoggingOptions::from_env())?;

    let config = EnvConfig::from_env()?;
    let app_guid = required_env_var("CF_APP_GUID")?;
    let app_name = env_var("CF_APP_NAME").unwrap_or_else(|| app_guid.clone());
    let org = required_env_var("CF_ORG")?;
    let space = required_env_var("CF_SPACE")?;

    let http = build_http_client(DEFAULT_REQUEST_TIMEOUT, config.skip_ssl_validation)?;
    let auth = UaaAuthService::new(http.clone(), &config.uaa_endpoint)
        .with_client(config.uaa_client_id.clone(), config.uaa_client_secret.clone());
    let api = HttpCloudController::new(http, &config.api_endpoint, &config.doppler_endpoint)?;

    let store = Arc::new(StaticConfigStore::from_env_config(&config));
    let tokens = Arc::new(TokenManager::new(store.clone(), Arc::new(auth)));
    let client = Arc::new(PlatformClient::new(
        Arc::new(api),
        tokens,
        config.settings.retry.clone(),
    ));
    let watcher = StagingWatcher::new(
        client,
        store,
        Arc::new(StdoutLogSink),
        config.settings.clone(),
    );

    info!(app = %app_name, %org, %space, "Watching staging");

    let app = Application::new(app_guid, app_name);
    let watched = tokio::select! {
        result = watcher.watch_staging(&app, &org, &space, None) => result?,
        _ = tokio::signal::ctrl_c() => {
            anyhow::bail!("Interrupted");
        }
    };

    println!(
        "{}: package {}, state {}, {} instance(s), {}M memory, {}M disk{}",
        watched.name,
        watched.package_state,
        watched.state,
        watched.instances,
        watched.memory,
        watched.disk,
        watched
            .buildpack
            .as_deref()
            .map(|b| format!(", buildpack {b}"))
            .unwrap_or_default()
    );

    Ok(())
}
