mod errors;
pub mod handlers;

pub use errors::ErrorResponse;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::DurableFlowConfig;
use crate::engine::FlowEngine;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub engine: FlowEngine,
}

/// Build the router exposing `engine`.
pub fn router(engine: FlowEngine, max_body: usize) -> Router {
    let state = Arc::new(AppState { engine });

    Router::new()
        .route("/health", get(handlers::health))
        .route("/flows", get(handlers::list_flows))
        .route("/flows/{name}/run", post(handlers::run_flow))
        .route("/flows/{name}/schedule", post(handlers::schedule_flow))
        .route("/flows/{name}/stream", post(handlers::stream_flow))
        .route("/flows/{name}/runs", get(handlers::list_runs))
        .route("/flows/{name}/runs/{id}", get(handlers::get_run))
        .route("/flows/{name}/runs/{id}/resume", post(handlers::resume_run))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the REST API server.
pub async fn serve(config: &DurableFlowConfig, engine: FlowEngine) -> Result<()> {
    let app = router(engine, config.max_body());

    let addr: SocketAddr = config.bind_addr().parse()?;
    info!("durableflow API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
