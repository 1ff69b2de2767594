use authz_server::api::start_webserver;
use authz_server::config::load_config;
use authz_server::directory::{AccountDirectory, HttpAccountDirectory};
use authz_server::oauth2::{
    Clock, OAuth2State, RotatingKeyProvider, SigningKeyProvider, SystemClock, spawn_purge_task,
};
use std::sync::Arc;
use tokio::time::{Duration, interval};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// How often expired codes, refresh tokens, sessions and pending logins are dropped.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

fn initialize_standard_tracing() {
    let default_directives = "authz_server=info,tower_http=info,hyper=warn";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer().with_target(true).with_level(true);

    registry.with(layer).init();
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    initialize_standard_tracing();

    let config = load_config()?;
    tracing::info!(
        issuer = %config.issuer_url,
        directory = %config.directory.base_url,
        clients = config.clients.len(),
        google = config.federation.google.is_some(),
        "Loaded configuration"
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.directory.timeout_ms))
        .build()?;

    let directory: Arc<dyn AccountDirectory> =
        Arc::new(HttpAccountDirectory::new(&config.directory.base_url, http.clone())?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let keys = Arc::new(RotatingKeyProvider::new(
        clock.clone(),
        time::Duration::seconds(config.tokens.key_overlap_secs),
    )?);

    let state = OAuth2State::from_config(
        &config,
        directory,
        keys.clone() as Arc<dyn SigningKeyProvider>,
        clock,
        http,
    )?;

    spawn_purge_task(state.clone(), PURGE_INTERVAL);

    if let Some(secs) = config.tokens.key_rotation_interval_secs {
        let keys = keys.clone();
        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(secs));
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = keys.rotate() {
                    tracing::error!(error = %e, "Failed to rotate signing key");
                }
            }
        });
    }

    start_webserver(state, &config.listen_addr).await?;
    Ok(())
}
