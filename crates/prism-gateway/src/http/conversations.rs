use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;
use crate::auth::require_dashboard_auth;
use crate::error::ApiResult;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationQuery {
    pub domain: Option<String>,
    pub account_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    #[serde(default)]
    pub exclude_subtasks: bool,
}

/// GET /api/conversations?domain&accountId&limit&offset&excludeSubtasks
pub async fn list_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ConversationQuery>,
) -> ApiResult<Json<Value>> {
    require_dashboard_auth(&state, &headers)?;

    let limit = query
        .limit
        .unwrap_or(prism_storage::requests::DEFAULT_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);
    let conversations = state.requests.list_conversations(
        query.domain.as_deref(),
        query.account_id.as_deref(),
        query.exclude_subtasks,
        limit,
        offset,
    )?;
    Ok(Json(json!({
        "conversations": conversations,
        "limit": limit,
        "offset": offset,
    })))
}

/// GET /api/conversations/:id — branch map plus the request list.
pub async fn detail_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_dashboard_auth(&state, &headers)?;

    let detail = state.requests.conversation_detail(&id)?;
    Ok(Json(json!({ "conversation": detail })))
}
