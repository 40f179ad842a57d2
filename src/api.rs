//! REST API for the support agent
//!
//! A thin adapter over the session boundary: every route maps onto one
//! orchestrator or knowledge index call.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agent::Orchestrator;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatRequest {
    /// New session when absent
    pub session_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RebuildRequest {
    /// Directory to load instead of the configured one, relative to it;
    /// must resolve to a path inside the configured directory
    pub knowledge_dir: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

fn ok<T: Serialize>(data: T) -> ApiResult {
    (StatusCode::OK, Json(ApiResponse::success(data)))
}

fn fail(status: StatusCode, message: impl Into<String>) -> ApiResult {
    (status, Json(ApiResponse::error(message.into())))
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub knowledge_dir: PathBuf,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let graph_nodes = state
        .orchestrator
        .knowledge()
        .stats()
        .await
        .map(|s| s.nodes);

    Json(serde_json::json!({
        "status": "healthy",
        "oracle": state.orchestrator.oracle_name(),
        "capabilities": state.orchestrator.registry().list(),
        "graph_nodes": graph_nodes,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat_handler(State(state): State<ApiState>, Json(req): Json<ChatRequest>) -> ApiResult {
    if req.message.trim().is_empty() {
        return fail(StatusCode::BAD_REQUEST, "message must not be empty");
    }

    let session_id = match req.session_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    };

    info!(session_id = %session_id, "Chat turn received");
    let response = state.orchestrator.handle_turn(&session_id, &req.message).await;

    ok(serde_json::json!({
        "session_id": response.session_id,
        "answer": response.answer,
        "outcome": response.trace.outcome,
        "trace": response.trace,
    }))
}

/// =============================
/// Knowledge Graph Endpoints
/// =============================

async fn rebuild_graph(
    State(state): State<ApiState>,
    body: Option<Json<RebuildRequest>>,
) -> ApiResult {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let dir = match resolve_knowledge_dir(&state.knowledge_dir, req.knowledge_dir.as_deref()) {
        Ok(dir) => dir,
        Err(e) => {
            warn!(requested = ?req.knowledge_dir, error = %e, "Graph rebuild path refused");
            return fail(StatusCode::FORBIDDEN, e);
        }
    };

    let knowledge = state.orchestrator.knowledge();
    match knowledge.rebuild_from_dir(&dir).await {
        Ok(graph) => ok(graph.stats()),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Graph rebuild rejected");
            fail(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        }
    }
}

/// Resolve a requested knowledge directory against the configured base.
/// Absolute paths, `..` escapes and symlinks out of the base are refused.
fn resolve_knowledge_dir(base: &FsPath, requested: Option<&str>) -> Result<PathBuf, String> {
    let requested = match requested.map(str::trim) {
        None | Some("") => return Ok(base.to_path_buf()),
        Some(r) => r,
    };

    let outside = || {
        "knowledge_dir must name a directory inside the configured knowledge directory".to_string()
    };
    let root = base.canonicalize().map_err(|_| outside())?;
    let candidate = root.join(requested).canonicalize().map_err(|_| outside())?;
    if candidate.starts_with(&root) {
        Ok(candidate)
    } else {
        Err(outside())
    }
}

async fn graph_stats(State(state): State<ApiState>) -> ApiResult {
    match state.orchestrator.knowledge().stats().await {
        Some(stats) => ok(stats),
        None => fail(StatusCode::NOT_FOUND, "knowledge graph has not been built"),
    }
}

/// =============================
/// Session Endpoints
/// =============================

async fn end_session(State(state): State<ApiState>, Path(session_id): Path<String>) -> ApiResult {
    match state.orchestrator.end_session(&session_id).await {
        Ok(deleted) => ok(serde_json::json!({ "session_id": session_id, "deleted": deleted })),
        Err(e) => fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>, knowledge_dir: PathBuf) -> Router {
    let state = ApiState {
        orchestrator,
        knowledge_dir,
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat_handler))
        .route("/api/graph/rebuild", post(rebuild_graph))
        .route("/api/graph/stats", get(graph_stats))
        .route("/api/sessions/:id", delete(end_session))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    knowledge_dir: PathBuf,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator, knowledge_dir);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
