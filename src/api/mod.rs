mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::routing::{get, post};
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cli::config::CampaignFlowConfig;
use crate::engine::WorkflowEngine;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    /// Bounds how many runs execute at once across all projects.
    pub runs: Arc<Semaphore>,
}

impl AppState {
    pub fn new(engine: Arc<WorkflowEngine>, max_concurrent_runs: usize) -> Self {
        Self {
            engine,
            runs: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
        }
    }
}

/// Routes of the REST API, without transport layers.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/projects", get(handlers::list_projects))
        .route(
            "/projects/{key}",
            get(handlers::get_project).delete(handlers::delete_project),
        )
        .route("/projects/{key}/runs", post(handlers::start_run))
        .route("/graph", get(handlers::get_graph))
        .route("/health", get(handlers::health))
        .with_state(state)
}

/// Start the REST API server.
pub async fn serve(config: CampaignFlowConfig) -> Result<()> {
    let engine = Arc::new(config.build_engine().await?);
    let state = Arc::new(AppState::new(engine, config.max_concurrent_runs()));

    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", config.host(), config.port()).parse()?;
    info!(
        max_concurrent_runs = config.max_concurrent_runs(),
        "CampaignFlow API server listening on {}", addr
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
