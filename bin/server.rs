// CivicAPI Bills - Web Server

use anyhow::{Context, Result};
use civicapi::api::{build_router, AppState, SERVICE_NAME};
use civicapi::{logging, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    logging::init(&config.log_level);

    let state = AppState::new(config.clone()).context("Failed to open database")?;
    tracing::info!(db_path = %state.store.path().display(), "{} startup", SERVICE_NAME);
    tracing::info!(
        public_base_url = %config.public_base_url,
        debug = config.debug,
        "Config"
    );
    if config.api_key.is_empty() {
        tracing::warn!("CIVICAPI_API_KEY is not set; protected endpoints will answer 401");
    }

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    tracing::info!("Server running on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
    }
    tracing::info!("Shutting down");
}
