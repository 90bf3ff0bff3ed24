use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use prism_storage::CreateOutcome;

use crate::app::AppState;
use crate::auth::require_dashboard_auth;
use crate::error::{ApiError, ApiResult};

const API_ACTOR: &str = "api";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub conversation_id: String,
    #[serde(default = "default_branch")]
    pub branch_id: String,
    pub custom_prompt: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

/// POST /api/analyses — 201 with a fresh pending row, or 409 with the
/// existing row for this conversation/branch.
pub async fn create_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateRequest>,
) -> ApiResult<Response> {
    require_dashboard_auth(&state, &headers)?;

    let outcome = state.analyses.create(
        &req.conversation_id,
        &req.branch_id,
        req.custom_prompt.as_deref(),
        API_ACTOR,
    )?;

    Ok(match outcome {
        CreateOutcome::Created(row) => {
            (StatusCode::CREATED, Json(json!({ "analysis": row }))).into_response()
        }
        CreateOutcome::Exists(row) => {
            (StatusCode::CONFLICT, Json(json!({ "analysis": row }))).into_response()
        }
    })
}

/// GET /api/analyses/:conversationId/:branchId
pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((conversation_id, branch_id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    require_dashboard_auth(&state, &headers)?;

    let row = state
        .analyses
        .get(&conversation_id, &branch_id)?
        .ok_or_else(|| {
            ApiError::not_found(format!("analysis {conversation_id}/{branch_id}"))
        })?;
    Ok(Json(json!({ "analysis": row })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateRequest {
    pub custom_prompt: Option<String>,
}

/// POST /api/analyses/:conversationId/:branchId/regenerate
///
/// The body is optional; an empty POST regenerates with the default prompt.
pub async fn regenerate_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((conversation_id, branch_id)): Path<(String, String)>,
    body: axum::body::Bytes,
) -> ApiResult<Response> {
    require_dashboard_auth(&state, &headers)?;

    let custom_prompt = serde_json::from_slice::<RegenerateRequest>(&body)
        .ok()
        .and_then(|r| r.custom_prompt);
    let row = state.analyses.regenerate(
        &conversation_id,
        &branch_id,
        custom_prompt.as_deref(),
        API_ACTOR,
    )?;
    Ok((StatusCode::CREATED, Json(json!({ "analysis": row }))).into_response())
}
