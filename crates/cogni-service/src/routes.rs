//! Router configuration.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{credits, health, runs};
use crate::state::AppState;

/// Maximum concurrent run streams.
const RUN_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Maximum concurrent requests for general API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Runs (edge-authenticated user header)
/// - `POST /v1/runs` - Execute a graph, streaming SSE (no request timeout;
///   the pipeline owns its own)
/// - `GET /v1/graphs` - Flat graph catalog
///
/// ## Credits (edge-authenticated user header)
/// - `GET /v1/credits/balance`
/// - `GET /v1/credits/entries`
/// - `GET /v1/credits/receipts`
/// - `POST /v1/credits/add` (admin key)
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config.cors_origins);
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout = Duration::from_secs(state.config.request_timeout_seconds);

    let state = Arc::new(state);

    // Streaming routes carry no blanket timeout; the pipeline enforces its
    // own budgets.
    let run_routes = Router::new()
        .route("/runs", post(runs::start_run))
        .layer(ConcurrencyLimitLayer::new(RUN_MAX_CONCURRENT_REQUESTS));

    let api_routes = Router::new()
        .route("/graphs", get(runs::list_graphs))
        .route("/credits/balance", get(credits::get_balance))
        .route("/credits/entries", get(credits::list_entries))
        .route("/credits/receipts", get(credits::list_receipts))
        .route("/credits/add", post(credits::admin_add_credits))
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS))
        .layer(TimeoutLayer::new(request_timeout));

    Router::new()
        .route("/health", get(health::health))
        .nest("/v1", run_routes.merge(api_routes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
