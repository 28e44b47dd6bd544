//! Portcullis - credential gateway

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use portcullis::{
    auth::{SigningKeys, TokenIssuer},
    config::{Args, ServiceConfig},
    db, logging, metrics,
    repository::create_repository,
    server::{self, AppState},
    services::UserService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let mut config = ServiceConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.apply_overrides(&args);

    logging::init(&config.log_level, config.log_format)?;

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Portcullis - credential gateway");
    info!("======================================");
    info!("Service: {}", config.service_name);
    info!("Listen: {}:{}", config.host, config.port);
    info!("Store: {:?} ({})", config.database.kind, config.database.kind.backend());
    info!(
        "Login rate limit: {} per {}ms",
        config.rate_limiter.limit, config.rate_limiter.interval_ms
    );
    info!("======================================");

    let metrics_handle = match metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Metrics disabled: {}", e);
            None
        }
    };

    let keys = SigningKeys::load(&config.private_key_path)
        .with_context(|| format!("loading signing key {}", config.private_key_path.display()))?;
    let issuer = Arc::new(TokenIssuer::new(keys));

    let client = db::connect(&config.database)
        .await
        .context("connecting to the store")?;

    let repository = create_repository(config.database.kind.backend(), Arc::clone(&client))?;
    repository
        .ensure_indices()
        .await
        .context("ensuring store schema")?;

    let users = Arc::new(UserService::new(repository, issuer));
    let state = Arc::new(AppState::new(
        config,
        client,
        Arc::clone(&users),
        metrics_handle,
    ));

    server::run(state, shutdown_signal()).await?;

    if let Err(e) = users.shutdown().await {
        warn!("Store disconnect failed: {}", e);
    }
    info!("Portcullis stopped");
    Ok(())
}

/// Resolve on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
