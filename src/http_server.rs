//! HTTP server implementation using Axum.

use crate::error::AllocatorError;
use crate::state::AppState;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const RELEASED_MESSAGE: &str = "Container released successfully.";

// Request/Response types
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllocateRequest {
    user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AllocateResponse {
    sandbox_id: String,
    endpoint: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseRequest {
    #[serde(alias = "containerId")]
    sandbox_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AssignmentInfo {
    user_id: String,
    sandbox_id: String,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(err: AllocatorError) -> ApiError {
    let status = match &err {
        AllocatorError::InvalidUserId => StatusCode::BAD_REQUEST,
        AllocatorError::Provisioning(_) | AllocatorError::Release { .. } => StatusCode::BAD_GATEWAY,
        AllocatorError::InconsistentState { .. } => StatusCode::CONFLICT,
        AllocatorError::CreateOutcomeUnknown { .. } => StatusCode::GATEWAY_TIMEOUT,
    };
    (status, Json(json!({ "error": err.to_string() })))
}

/// Unreadable request bodies get the same JSON error shape as failed operations.
fn rejection_error(rejection: JsonRejection) -> ApiError {
    (
        rejection.status(),
        Json(json!({ "error": rejection.body_text() })),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/containers", get(list_assignments))
        .route("/api/containers/allocate", post(allocate))
        .route("/api/containers/release", post(release))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await
}

async fn health() -> &'static str {
    "OK"
}

async fn allocate(
    State(state): State<AppState>,
    payload: Result<Json<AllocateRequest>, JsonRejection>,
) -> Result<Json<AllocateResponse>, ApiError> {
    let Json(req) = payload.map_err(rejection_error)?;
    match state.manager.allocate(&req.user_id).await {
        Ok(info) => Ok(Json(AllocateResponse {
            sandbox_id: info.sandbox_id,
            endpoint: info.endpoint.to_string(),
        })),
        Err(e) => {
            error!(user_id = %req.user_id, error = %e, "allocation failed");
            Err(api_error(e))
        }
    }
}

async fn release(
    State(state): State<AppState>,
    payload: Result<Json<ReleaseRequest>, JsonRejection>,
) -> Result<&'static str, ApiError> {
    let Json(req) = payload.map_err(rejection_error)?;
    match state.manager.release(&req.sandbox_id).await {
        Ok(()) => Ok(RELEASED_MESSAGE),
        Err(e) => {
            warn!(sandbox_id = %req.sandbox_id, error = %e, "release failed");
            Err(api_error(e))
        }
    }
}

async fn list_assignments(State(state): State<AppState>) -> Json<Vec<AssignmentInfo>> {
    let list = state
        .manager
        .assignments()
        .await
        .into_iter()
        .map(|(user_id, sandbox_id)| AssignmentInfo {
            user_id,
            sandbox_id,
        })
        .collect();
    Json(list)
}
