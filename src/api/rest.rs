// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The health probe is public and never
// touches the store; everything else requires a Bearer token validated by
// the `AdminAuth` extractor against the runtime config. CORS is permissive
// for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::AdminAuth;
use crate::app_state::AppState;
use crate::scheduler::AgentScheduler;

/// Shared handler context: the state plus the scheduler driving it.
pub struct ApiContext {
    pub state: Arc<AppState>,
    pub scheduler: Arc<AgentScheduler>,
}

/// Build the full REST router with CORS middleware and shared context.
pub fn router(context: Arc<ApiContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/agents", get(agents))
        .route("/api/v1/agents/:name/start", post(agent_start))
        .route("/api/v1/agents/:name/stop", post(agent_stop))
        .route("/api/v1/agents/:name/run", post(agent_run))
        .route("/api/v1/agents/:name/interval", post(agent_interval))
        .route("/api/v1/regime", get(regime))
        .route("/api/v1/uncertainty", get(uncertainty))
        .route("/api/v1/governor", get(governor))
        .route("/api/v1/allocator", get(allocator))
        .route("/api/v1/findings", get(findings))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(context)
}

// =============================================================================
// Health (public, no store I/O)
// =============================================================================

async fn health(State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "state_version": ctx.state.current_state_version(),
        "server_time": chrono::Utc::now().timestamp_millis(),
        "uptime_secs": ctx.state.start_time.elapsed().as_secs(),
    }))
}

// =============================================================================
// Snapshots (authenticated)
// =============================================================================

async fn full_state(_auth: AdminAuth, State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(ctx.state.build_snapshot())
}

async fn regime(_auth: AdminAuth, State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(ctx.state.control.regime_snapshot())
}

async fn uncertainty(_auth: AdminAuth, State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(ctx.state.control.uncertainty_snapshot())
}

async fn governor(_auth: AdminAuth, State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "risk": ctx.state.risk_state(),
        "dd_limit": ctx.state.governor.dd_limit(),
    }))
}

async fn allocator(_auth: AdminAuth, State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    Json(ctx.state.allocation.read().clone())
}

#[derive(Deserialize)]
struct FindingsQuery {
    #[serde(default = "default_findings_limit")]
    limit: usize,
}

fn default_findings_limit() -> usize {
    50
}

async fn findings(
    _auth: AdminAuth,
    State(ctx): State<Arc<ApiContext>>,
    Query(query): Query<FindingsQuery>,
) -> impl IntoResponse {
    match ctx.state.store.recent_findings(query.limit.min(500)) {
        Ok(findings) => Json(findings).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

// =============================================================================
// Agent control (authenticated)
// =============================================================================

async fn agents(_auth: AdminAuth, State(ctx): State<Arc<ApiContext>>) -> impl IntoResponse {
    match ctx.state.store.agent_statuses() {
        Ok(statuses) => Json(statuses).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Deserialize, Default)]
struct StartRequest {
    #[serde(default)]
    force: bool,
}

async fn agent_start(
    _auth: AdminAuth,
    State(ctx): State<Arc<ApiContext>>,
    Path(name): Path<String>,
    body: Option<Json<StartRequest>>,
) -> impl IntoResponse {
    let force = body.map(|Json(req)| req.force).unwrap_or(false);
    match ctx.scheduler.start(&name, force) {
        Ok(()) => {
            info!(agent = %name, force, "agent started via API");
            Json(serde_json::json!({"agent": name, "started": true, "force": force}))
                .into_response()
        }
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn agent_stop(
    _auth: AdminAuth,
    State(ctx): State<Arc<ApiContext>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match ctx.scheduler.stop(&name) {
        Ok(()) => {
            info!(agent = %name, "agent stopped via API");
            Json(serde_json::json!({"agent": name, "stopped": true})).into_response()
        }
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn agent_run(
    _auth: AdminAuth,
    State(ctx): State<Arc<ApiContext>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match ctx.scheduler.run_now(&name).await {
        Ok(()) => Json(serde_json::json!({"agent": name, "triggered": true})).into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct IntervalRequest {
    minutes: u64,
}

async fn agent_interval(
    _auth: AdminAuth,
    State(ctx): State<Arc<ApiContext>>,
    Path(name): Path<String>,
    Json(req): Json<IntervalRequest>,
) -> impl IntoResponse {
    if req.minutes == 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "interval must be at least 1 minute"})),
        )
            .into_response();
    }
    match ctx.scheduler.update_interval(&name, req.minutes) {
        Ok(()) => {
            info!(agent = %name, minutes = req.minutes, "interval updated via API");
            Json(serde_json::json!({"agent": name, "interval_minutes": req.minutes}))
                .into_response()
        }
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}
