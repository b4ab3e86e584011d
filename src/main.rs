//! `activity-syncd`: run the sync engine until interrupted.
//!
//! Configuration comes from the environment (see [`SyncConfig`]). Logging
//! follows `RUST_LOG`, defaulting to `info`.

use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};

use activity_sync::{
    ActivitySource, RateLimiter, StravaApi, StravaTokenRefresher, SyncConfig, SyncEngine,
    SyncError, WebDavClient,
};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("[activity-syncd] {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("[activity-syncd] Starting with {:?}", config);

    let mut engine = match build_engine(&config) {
        Ok(engine) => engine,
        Err(e) => {
            error!("[activity-syncd] {}", e);
            return ExitCode::FAILURE;
        }
    };

    engine.run(shutdown_signal()).await;
    info!("[activity-syncd] Stopped");
    ExitCode::SUCCESS
}

fn build_engine(
    config: &SyncConfig,
) -> Result<SyncEngine<StravaApi, StravaTokenRefresher, WebDavClient>, SyncError> {
    let api = StravaApi::new().map_err(|e| SyncError::Config {
        message: e.to_string(),
    })?;
    let refresher = StravaTokenRefresher::new(
        &config.source_client_id,
        &config.source_client_secret,
        &config.source_refresh_token,
    )?;
    let limiter = RateLimiter::strava(
        config.rate_limit_short,
        config.rate_limit_daily,
        config.rate_limit_max_wait,
    );
    let storage = WebDavClient::new(&config.sink_url, &config.sink_username, &config.sink_password)
        .map_err(|e| SyncError::Config {
            message: e.to_string(),
        })?;

    let source = ActivitySource::new(api, refresher, limiter);
    Ok(
        SyncEngine::new(source, Arc::new(storage), &config.target_folder)
            .with_interval(config.sync_interval)
            .with_error_backoff(config.error_backoff, config.error_backoff_max)
            .with_persist_mode(config.persist_mode),
    )
}

/// Completes on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("[activity-syncd] Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("[activity-syncd] Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("[activity-syncd] Received Ctrl-C"),
        _ = terminate => info!("[activity-syncd] Received SIGTERM"),
    }
}
