//! HTTP server implementation

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use super::handlers::{cancel_fetcher_handler, drop_snapshots_handler, force_snapshot_handler, reselect_handler, status_handler};
use crate::manager::ReplicationManager;

/// Build the admin router over a running manager
pub fn admin_router(manager: Arc<ReplicationManager>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/snapshots/force", post(force_snapshot_handler))
        .route("/snapshots", delete(drop_snapshots_handler))
        .route("/sync-source/reselect", post(reselect_handler))
        .route("/fetcher/cancel", post(cancel_fetcher_handler))
        .layer(CorsLayer::permissive())
        .with_state(manager)
}

/// Serve the admin interface until the listener fails
pub async fn run_admin_server(
    addr: &str,
    manager: Arc<ReplicationManager>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = admin_router(manager);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Admin interface available at http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
