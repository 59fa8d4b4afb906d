//! JSON ops surface: event ingestion, cluster status, run listing, and the
//! settings reload trigger. The full administrative UI lives elsewhere;
//! this is only what external systems need to feed and observe the engine.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::coord::{cluster_epoch, keys, CoordinationStore};
use crate::settings::{keys as setting_keys, SettingsResolver};
use crate::store::RunStore;
use crate::worker::WorkerRuntime;

const TOKEN_HEADER: &str = "x-taskherd-token";

#[derive(Clone)]
pub struct HttpState {
    pub store: RunStore,
    pub coord: Arc<dyn CoordinationStore>,
    pub resolver: Arc<SettingsResolver>,
    pub runtime: Arc<WorkerRuntime>,
}

#[derive(Deserialize)]
struct IngestEventRequest {
    event_type: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    dedupe_key: Option<String>,
}

#[derive(Serialize)]
struct IngestEventResponse {
    ok: bool,
    event_id: String,
    deduped: bool,
}

#[derive(Serialize)]
struct ClusterStatusResponse {
    worker_id: String,
    role: String,
    observed_epoch: i64,
    leader_worker_id: Option<String>,
    workers: Vec<WorkerView>,
}

#[derive(Serialize)]
struct WorkerView {
    worker_id: String,
    node_id: String,
    role: String,
    rpc_target: String,
    last_seen_unix_ms: i64,
    load: i32,
    current_job_run_id: String,
    detached: bool,
    draining: bool,
}

#[derive(Serialize)]
struct RunView {
    id: String,
    job_definition_id: String,
    state: String,
    attempt: i32,
    scheduled_for: Option<String>,
    assigned_worker_id: Option<String>,
    exit_code: Option<i32>,
    error_summary: String,
}

#[derive(Deserialize)]
struct RunsQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn run_http_api(addr: SocketAddr, state: HttpState) {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/events", post(ingest_event_handler))
        .route("/api/cluster", get(cluster_status_handler))
        .route("/api/runs", get(list_runs_handler))
        .route("/api/settings", get(settings_handler))
        .route("/api/settings/reload", post(reload_settings_handler))
        .layer(cors)
        .with_state(state);

    tracing::info!(addr = %addr, "Starting HTTP API");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind HTTP API");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "HTTP API failed");
    }
}

/// Shared-token check. Read fresh-ish through the resolver; an unset token
/// leaves the surface open, which is only sane for development setups.
async fn authorized(state: &HttpState, headers: &HeaderMap) -> bool {
    let required = state
        .resolver
        .get_str(setting_keys::EVENTS_API_TOKEN)
        .await
        .unwrap_or_default();
    if required.is_empty() {
        return true;
    }
    headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|token| token == required)
        .unwrap_or(false)
}

async fn ingest_event_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(request): Json<IngestEventRequest>,
) -> impl IntoResponse {
    if !authorized(&state, &headers).await {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"ok": false}))).into_response();
    }
    let event_type = request.event_type.trim();
    if event_type.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"ok": false, "error": "event_type is required"})),
        )
            .into_response();
    }
    let dedupe_key = request
        .dedupe_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty());

    match state
        .store
        .insert_event(event_type, request.payload, dedupe_key, Utc::now())
        .await
    {
        Ok((event, deduped)) => Json(IngestEventResponse {
            ok: true,
            event_id: event.id.to_string(),
            deduped,
        })
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Event ingestion failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"ok": false})),
            )
                .into_response()
        }
    }
}

async fn cluster_status_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let leader_worker_id = state.coord.get(&keys::leader_lock()).await.ok().flatten();
    let epoch = cluster_epoch(&state.coord).await.unwrap_or(0);
    let workers = state
        .coord
        .scan_workers()
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|w| WorkerView {
            rpc_target: w.rpc_target(),
            worker_id: w.worker_id,
            node_id: w.node_id,
            role: w.role.to_string(),
            last_seen_unix_ms: w.last_seen_unix_ms,
            load: w.load,
            current_job_run_id: w.current_job_run_id,
            detached: w.detached,
            draining: w.draining,
        })
        .collect();

    Json(ClusterStatusResponse {
        worker_id: state.runtime.worker_id(),
        role: state.runtime.role().to_string(),
        observed_epoch: epoch,
        leader_worker_id,
        workers,
    })
}

async fn list_runs_handler(
    State(state): State<HttpState>,
    Query(query): Query<RunsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.clamp(1, 500);
    match state.store.recent_runs(limit).await {
        Ok(runs) => Json(
            runs.into_iter()
                .map(|run| RunView {
                    id: run.id.to_string(),
                    job_definition_id: run.job_definition_id.to_string(),
                    state: run.state.to_string(),
                    attempt: run.attempt,
                    scheduled_for: run.scheduled_for.map(|t| t.to_rfc3339()),
                    assigned_worker_id: run.assigned_worker_id,
                    exit_code: run.exit_code,
                    error_summary: run.error_summary,
                })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Run listing failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn settings_handler(State(state): State<HttpState>) -> impl IntoResponse {
    match state.resolver.public_snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Settings snapshot failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn reload_settings_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers).await {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"ok": false}))).into_response();
    }
    match state.coord.set_flag(&keys::settings_reload()).await {
        Ok(()) => Json(serde_json::json!({"ok": true, "note": "reload requested"})).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Reload request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"ok": false})),
            )
                .into_response()
        }
    }
}
