//! Transport Server
//!
//! The HTTP face of a node. Two endpoints: `GET /heartbeat` (unauthenticated
//! liveness) and `POST /submit` (bearer-authenticated task intake). A valid
//! submission is enqueued into this node's own worker pool, resolved through
//! this node's own registry, and tagged with a `remote:` display-name prefix
//! so operators can tell forwarded work from locally submitted work.
//!
//! Status mapping: 200 enqueued, 400 malformed body or bad priority code,
//! 401 missing/incorrect token, 404 unknown path (axum fallback).

use super::protocol::{
    ENDPOINT_HEARTBEAT, ENDPOINT_SUBMIT, ErrorResponse, HeartbeatResponse,
    SubmitTaskRequest, SubmitTaskResponse,
};
use crate::scheduler::pool::{SubmitOptions, WorkerPool};
use crate::scheduler::types::{Priority, WorkSpec};

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use std::sync::Arc;

pub struct ServerState {
    pub pool: Arc<WorkerPool>,
    /// When set, `/submit` requires `Authorization: Bearer <token>`.
    pub auth_token: Option<String>,
}

/// Builds the node's HTTP router.
pub fn app(state: Arc<ServerState>) -> Router {
    Router::new()
        .route(ENDPOINT_HEARTBEAT, get(handle_heartbeat))
        .route(ENDPOINT_SUBMIT, post(handle_submit))
        .layer(Extension(state))
}

pub async fn handle_heartbeat() -> Json<HeartbeatResponse> {
    Json(HeartbeatResponse {
        status: "ok".to_string(),
    })
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

pub async fn handle_submit(
    Extension(state): Extension<Arc<ServerState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Some(expected) = &state.auth_token {
        let presented = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        if presented != Some(format!("Bearer {}", expected).as_str()) {
            tracing::warn!("Rejected submission: missing or incorrect bearer token");
            return error_response(
                StatusCode::UNAUTHORIZED,
                "invalid or missing bearer token".to_string(),
            );
        }
    }

    // Body is parsed by hand so a malformed payload maps to a plain 400
    // instead of axum's extractor rejection.
    let request: SubmitTaskRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Rejected submission: malformed body ({})", e);
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("malformed request body: {}", e),
            );
        }
    };

    let priority = match Priority::from_code(request.priority) {
        Some(priority) => priority,
        None => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("invalid priority code {}", request.priority),
            );
        }
    };

    let spec = WorkSpec::Named {
        name: request.name.clone(),
        payload: request.payload,
        context: request.context,
    };
    let opts = SubmitOptions {
        priority,
        name: Some(format!("remote:{}", request.name)),
        labels: request.labels.into_iter().collect(),
        ..SubmitOptions::default()
    };

    match state.pool.submit(spec, opts) {
        Ok(id) => {
            tracing::info!("Accepted remote task '{}' as {}", request.name, id.0);
            Json(SubmitTaskResponse { enqueued: true }).into_response()
        }
        Err(e) => {
            tracing::error!("Failed to enqueue remote task '{}': {}", request.name, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
