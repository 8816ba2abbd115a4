use anyhow::{self, Error as AnyhowError};
use server::{AppState, ServerError, routes, shutdown_signal};
use services::services::config::{ConfigError, OrchestratorConfig};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Debug, Error)]
pub enum WebhookServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

#[tokio::main]
async fn main() -> Result<(), WebhookServerError> {
    // Install rustls crypto provider before any TLS operations (required for GitHub API calls)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,server={level},services={level},utils={level}",
        level = log_level
    );
    let filter = EnvFilter::try_new(&filter_string).expect("Failed to create tracing filter");
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let config = OrchestratorConfig::from_env()?;
    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!(
        container = %config.container_name,
        image = %config.test_image,
        runtime = %config.runtime_binary,
        trigger = %config.trigger_phrase,
        "Configuration loaded"
    );

    let state = AppState::from_config(config)?;
    if let Err(e) = state.orchestrator().reap_orphan().await {
        tracing::error!(error = %e, "Failed to remove job container left by a previous run");
    }
    let app_router = routes::router(state.clone());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}"))?;
    tracing::info!("Server running on http://{}", listener.local_addr()?);

    axum::serve(listener, app_router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.orchestrator().shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}
