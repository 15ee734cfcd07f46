//! Cogni Service - graph execution and billing ingress.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cogni_service::{create_router, AppState, ServiceConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cogni=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::from_env();

    tracing::info!(
        service = %config.otel_service_name,
        listen_addr = %config.listen_addr,
        database_url = %config.database_url,
        litellm_base_url = %config.litellm_base_url,
        sandbox_enabled = config.sandbox_enabled,
        langfuse_configured = config.langfuse_base_url.is_some(),
        "Service configuration loaded"
    );

    let state = AppState::new(config.clone())?;

    // Reap proxy containers and volumes left by a crashed process before
    // accepting runs.
    state.sweep_orphans().await;

    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    axum::serve(listener, app).await?;

    Ok(())
}
