use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;
use crate::auth::require_dashboard_auth;
use crate::error::{ApiError, ApiResult};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentQuery {
    pub account_id: String,
    /// Window length in minutes.
    #[serde(default = "default_window")]
    pub window: u32,
    pub domain: Option<String>,
    pub model: Option<String>,
}

fn default_window() -> u32 {
    300
}

/// GET /api/token-usage/current?accountId&window&domain&model
pub async fn current_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<CurrentQuery>,
) -> ApiResult<Json<Value>> {
    require_dashboard_auth(&state, &headers)?;

    if query.window == 0 {
        return Err(ApiError::invalid_request("window must be positive"));
    }
    let usage = state.requests.current_window(
        &query.account_id,
        query.window,
        query.domain.as_deref(),
        query.model.as_deref(),
    )?;
    Ok(Json(json!({ "usage": usage })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyQuery {
    pub account_id: Option<String>,
    #[serde(default = "default_days")]
    pub days: u32,
    pub domain: Option<String>,
    #[serde(default)]
    pub aggregate: bool,
}

fn default_days() -> u32 {
    30
}

/// GET /api/token-usage/daily?accountId&days&domain&aggregate
pub async fn daily_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<DailyQuery>,
) -> ApiResult<Json<Value>> {
    require_dashboard_auth(&state, &headers)?;

    let usage = state.requests.daily_usage(
        query.account_id.as_deref(),
        query.days,
        query.domain.as_deref(),
        query.aggregate,
    )?;
    Ok(Json(json!({ "usage": usage })))
}

#[derive(Deserialize)]
pub struct TokenStatsQuery {
    pub domain: Option<String>,
}

/// GET /token-stats?domain= — aggregated per-domain counters.
pub async fn token_stats_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenStatsQuery>,
) -> ApiResult<Json<Value>> {
    require_dashboard_auth(&state, &headers)?;

    let stats = state.requests.domain_token_stats(query.domain.as_deref())?;
    Ok(Json(json!({ "domains": stats })))
}
