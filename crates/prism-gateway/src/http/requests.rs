use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use prism_storage::types::RequestFilter;

use crate::app::AppState;
use crate::auth::require_dashboard_auth;
use crate::error::{ApiError, ApiResult};

/// GET /api/requests?domain&model&from&to&limit&offset
pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(filter): Query<RequestFilter>,
) -> ApiResult<Json<Value>> {
    require_dashboard_auth(&state, &headers)?;

    let requests = state.requests.list(&filter)?;
    Ok(Json(json!({
        "requests": requests,
        "limit": filter.limit.unwrap_or(prism_storage::requests::DEFAULT_PAGE_SIZE),
        "offset": filter.offset.unwrap_or(0),
    })))
}

/// GET /api/requests/:id — full row with response body and chunks.
pub async fn detail_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_dashboard_auth(&state, &headers)?;

    let detail = state
        .requests
        .get(&id)?
        .ok_or_else(|| ApiError::not_found(format!("request {id}")))?;
    Ok(Json(json!({ "request": detail })))
}
