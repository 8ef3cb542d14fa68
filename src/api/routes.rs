//! API routes.
//!
//! Ingress: `POST /decisions`, `POST /feedback`, `GET /status`,
//! `GET /metrics`, `GET /healthz`.
//! Federation: `GET /federation/memory_ids`, `GET /federation/memory/:id`,
//! `GET /federation/projection`, `GET /federation/peers`.
//! Admin: provider overlay updates, capacity step reset, snapshots and
//! retention.

use crate::error::RouteError;
use crate::federation::{MerkleProjection, PeerConfig};
use crate::models::Outcome;
use crate::providers::{Overlay, Provider};
use crate::router::{DecideRequest, RouterCore};
use axum::extract::{Path as AxumPath, Query, State as AxumState};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<RouterCore>,
    pub peers: Arc<Vec<PeerConfig>>,
    pub node_id: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/healthz", get(healthz))
        .route("/decisions", post(post_decision))
        .route("/feedback", post(post_feedback))
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .route("/federation/memory_ids", get(get_memory_ids))
        .route("/federation/memory/:id", get(get_memory))
        .route("/federation/projection", get(get_projection))
        .route("/federation/peers", get(get_peers))
        .route("/admin/providers", post(post_provider))
        .route("/admin/providers/:id/overlay", post(post_overlay))
        .route("/admin/providers/reset_step", post(post_reset_step))
        .route("/admin/snapshot", post(post_snapshot))
        .route("/admin/retention", post(post_retention))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn service_info(AxumState(state): AxumState<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "gridroute",
        "node_id": state.node_id,
        "endpoints": {
            "decisions": "/decisions",
            "feedback": "/feedback",
            "status": "/status",
            "metrics": "/metrics",
            "federation": "/federation/memory_ids",
        }
    }))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn post_decision(
    AxumState(state): AxumState<AppState>,
    Json(request): Json<DecideRequest>,
) -> Result<Json<crate::router::DecideResponse>, RouteError> {
    state.router.decide(request).await.map(Json)
}

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    decision_id: String,
    outcome: Outcome,
}

async fn post_feedback(
    AxumState(state): AxumState<AppState>,
    Json(request): Json<FeedbackRequest>,
) -> Result<Json<crate::router::FeedbackResponse>, RouteError> {
    state
        .router
        .feedback(&request.decision_id, request.outcome)
        .await
        .map(Json)
}

async fn get_status(
    AxumState(state): AxumState<AppState>,
) -> Result<Json<crate::router::StatusResponse>, RouteError> {
    state.router.status().await.map(Json)
}

async fn get_metrics(AxumState(state): AxumState<AppState>) -> ([(&'static str, &'static str); 1], String) {
    let gauges = state.router.gauges();
    let body = state.router.metrics().to_prometheus(&gauges);
    ([("content-type", "text/plain; version=0.0.4")], body)
}

#[derive(Debug, Deserialize)]
struct MemoryIdsQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    after: Option<String>,
}

fn default_limit() -> usize {
    1_000
}

#[derive(Debug, Serialize)]
struct MemoryIdsResponse {
    ids: Vec<String>,
}

async fn get_memory_ids(
    AxumState(state): AxumState<AppState>,
    Query(query): Query<MemoryIdsQuery>,
) -> Json<MemoryIdsResponse> {
    let ids = state
        .router
        .federation()
        .list_ids(query.limit.clamp(1, 10_000), query.after.as_deref());
    Json(MemoryIdsResponse { ids })
}

async fn get_memory(
    AxumState(state): AxumState<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<crate::federation::MemoryRecord>, RouteError> {
    state
        .router
        .federation()
        .get(&id)
        .map(Json)
        .ok_or(RouteError::UnknownDecision(id))
}

async fn get_projection(AxumState(state): AxumState<AppState>) -> Json<MerkleProjection> {
    let records = state.router.federation().all();
    Json(MerkleProjection::compute(&state.node_id, &records))
}

async fn get_peers(AxumState(state): AxumState<AppState>) -> Json<Vec<PeerConfig>> {
    Json(state.peers.as_ref().clone())
}

async fn post_provider(
    AxumState(state): AxumState<AppState>,
    Json(provider): Json<Provider>,
) -> StatusCode {
    state.router.providers().upsert(provider);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
struct OverlayRequest {
    #[serde(flatten)]
    overlay: Overlay,
    #[serde(default)]
    active: Option<bool>,
}

async fn post_overlay(
    AxumState(state): AxumState<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(request): Json<OverlayRequest>,
) -> Result<StatusCode, RouteError> {
    let providers = state.router.providers();
    if !providers.set_overlay(&id, request.overlay) {
        return Err(RouteError::InvalidInput(format!("unknown provider {}", id)));
    }
    if let Some(active) = request.active {
        providers.set_active(&id, active);
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn post_reset_step(AxumState(state): AxumState<AppState>) -> StatusCode {
    state.router.providers().reset_step();
    StatusCode::NO_CONTENT
}

async fn post_snapshot(
    AxumState(state): AxumState<AppState>,
) -> Result<Json<serde_json::Value>, RouteError> {
    let snap = crate::strategist::Snapshot::capture(state.router.strategist());
    let digest = snap.digest_hex();
    let dir = state.router.snapshot_dir().to_path_buf();
    snap.save_to_dir(&dir)
        .map_err(|e| RouteError::Corruption(e.to_string()))?;
    Ok(Json(serde_json::json!({ "digest": digest })))
}

#[derive(Debug, Deserialize)]
struct RetentionRequest {
    cutoff_ms: i64,
}

async fn post_retention(
    AxumState(state): AxumState<AppState>,
    Json(request): Json<RetentionRequest>,
) -> Result<Json<serde_json::Value>, RouteError> {
    let purged = state
        .router
        .store()
        .purge_before(request.cutoff_ms)
        .map_err(|e| RouteError::Corruption(e.to_string()))?;
    Ok(Json(serde_json::json!({ "purged": purged })))
}
