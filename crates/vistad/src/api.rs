//! Operator HTTP API, bound to loopback.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::dispatch::WorkerPool;
use crate::migrate::{MigrationCoordinator, MigrationReport};
use crate::registry::{ConnectionMeta, ConnectionTable};

#[derive(Clone)]
pub struct ApiState {
    pub connections: ConnectionTable,
    pub pool: Arc<WorkerPool>,
    pub coordinator: MigrationCoordinator,
}

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub workers: usize,
    pub connections: Vec<ConnectionMeta>,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let mut connections: Vec<ConnectionMeta> = state.connections.iter().map(|e| e.value().clone()).collect();
    connections.sort_by_key(|c| (c.connection_id, c.established_at));
    Json(StatusResponse {
        workers: state.pool.len(),
        connections,
    })
}

// ── /migrate/{connection_id} ─────────────────────────────────────────────────

pub async fn handle_migrate(
    State(state): State<ApiState>,
    Path(connection_id): Path<u32>,
) -> Result<Json<MigrationReport>, (StatusCode, String)> {
    let report = state.coordinator.migrate(connection_id).await;
    if report.channels.is_empty() {
        return Err((StatusCode::NOT_FOUND, format!("no channels for connection {connection_id}")));
    }
    tracing::info!(connection_id, complete = report.complete, "migration started via API");
    Ok(Json(report))
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(handle_status))
        .route("/migrate/{connection_id}", post(handle_migrate))
        .with_state(state)
        .layer(cors)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
