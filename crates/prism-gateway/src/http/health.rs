use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;
use crate::auth::require_dashboard_auth;
use crate::error::ApiResult;

/// GET /health — liveness plus pipeline depth for observability.
pub async fn health_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_dashboard_auth(&state, &headers)?;

    Ok(Json(json!({
        "status": "ok",
        "uptime": state.uptime_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "storage_enabled": state.pipeline.is_enabled(),
        "write_queue_depth": state.pipeline.depth(),
        "write_drops": state.pipeline.dropped(),
        "tenants": state.credentials.tenant_count(),
    })))
}
