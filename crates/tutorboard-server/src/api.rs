//! HTTP routes for the trusted agent-execution path.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use tutorboard_core::patch::{ObjectQuery, Patch, PatchResult};
use tutorboard_core::WhiteboardObject;

use crate::registry::{ServerError, SessionRegistry};

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::NoSession => StatusCode::BAD_REQUEST,
            ServerError::Poisoned | ServerError::Store(_) | ServerError::Storage(_) => {
                warn!("Request failed: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
pub struct PatchRequest {
    #[serde(flatten)]
    pub patch: Patch,
    pub last_known_version: u64,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub version: u64,
    pub summary: String,
}

/// Health check
pub async fn health() -> &'static str {
    "ok"
}

/// Apply a patch. A stale `last_known_version` answers 409 with the current summary.
pub async fn apply_patch(
    State(registry): State<Arc<SessionRegistry>>,
    Path(session_id): Path<String>,
    Json(request): Json<PatchRequest>,
) -> Result<(StatusCode, Json<PatchResult>), ServerError> {
    let session = registry.get(&session_id)?;
    let result =
        session.apply_patch(&request.patch, request.last_known_version, registry.validator())?;
    let status = if result.success { StatusCode::OK } else { StatusCode::CONFLICT };
    Ok((status, Json(result)))
}

pub async fn summary(
    State(registry): State<Arc<SessionRegistry>>,
    Path(session_id): Path<String>,
) -> Result<Json<SummaryResponse>, ServerError> {
    let session = registry.get(&session_id)?;
    Ok(Json(SummaryResponse {
        version: session.version()?,
        summary: session.summary()?,
    }))
}

pub async fn find(
    State(registry): State<Arc<SessionRegistry>>,
    Path(session_id): Path<String>,
    Json(query): Json<ObjectQuery>,
) -> Result<Json<Vec<WhiteboardObject>>, ServerError> {
    let session = registry.get(&session_id)?;
    Ok(Json(session.find(&query)?))
}

pub async fn persist(
    State(registry): State<Arc<SessionRegistry>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ServerError> {
    registry.get(&session_id)?.request_persist()?;
    Ok(StatusCode::ACCEPTED)
}
