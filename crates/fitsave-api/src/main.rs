mod auth;
mod config;
mod cookies;
mod csrf;
mod error;
mod rate_limit;
mod routes;


use std::sync::Arc;

use fitsave_core::PersistenceGateway;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::routes::{app_router, AppState};

fn init_tracing() {
    let filter = EnvFilter::from_default_env()
        .add_directive("fitsave_api=info".parse().expect("valid directive"))
        .add_directive("fitsave_core=info".parse().expect("valid directive"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(%error, "Could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested; draining in-flight requests");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::debug!(?config, "Loaded configuration");
    tracing::info!(
        driver = config.storage.selection.kind().as_str(),
        strict_mode = config.storage.strict_mode,
        auth = config.auth.is_some(),
        anonymous = config.allow_anonymous,
        "Starting fitsave-api"
    );
    if config.auth.is_none() {
        tracing::warn!("FITSAVE_JWT_SECRET is not set; saved-result endpoints will answer 501");
    }

    let gateway = Arc::new(PersistenceGateway::from_config(&config.storage));
    if gateway.is_configured() {
        gateway.warm_up().await?;
    }

    let bind_addr = config.bind_addr.clone();
    let router = app_router(AppState::with_gateway(config, gateway));
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(%bind_addr, "fitsave-api listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
