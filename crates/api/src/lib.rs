//! `api` crate: HTTP REST API over the workflow engine.
//!
//! Exposes:
//!   POST   /api/v1/executions
//!   GET    /api/v1/executions/:id
//!   POST   /api/v1/executions/:id/resume
//!   POST   /api/v1/executions/:id/cancel
//!   POST   /api/v1/workflows/validate

pub mod error;
pub mod handlers;

use std::net::SocketAddr;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

pub use error::ApiError;
pub use handlers::AppState;

use handlers::{executions, workflows};

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/executions", post(executions::start))
        .route("/api/v1/executions/:id", get(executions::get))
        .route("/api/v1/executions/:id/resume", post(executions::resume))
        .route("/api/v1/executions/:id/cancel", post(executions::cancel))
        .route("/api/v1/workflows/validate", post(workflows::validate))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `addr` and serve until the process is stopped.
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}
