//! The request-forwarding pipeline: auth, credential resolution, hashing and
//! linking, durable pre-response insert, upstream dispatch, and completion
//! patching. Streaming responses hand off to the tee in [`stream`].

pub mod stream;

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use prism_core::types::{classify_request, count_tool_calls, MessagesBody, TokenUsage};
use prism_core::ErrorKind;
use prism_credentials::UpstreamAuth;
use prism_storage::types::{RequestPatch, RequestRecord};
use prism_storage::WriteItem;

use crate::app::AppState;
use crate::auth::{extract_bearer, tenant_from_host};
use crate::error::ApiError;

const API_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
];

/// POST /v1/messages — the proxied LLM surface.
pub async fn messages_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match handle_messages(state, headers, body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle_messages(
    state: Arc<AppState>,
    headers: HeaderMap,
    raw_body: Bytes,
) -> Result<Response, ApiError> {
    let request_id = Uuid::new_v4().to_string();
    let received_at = chrono::Utc::now();
    let started = Instant::now();

    // RECEIVED: tenant, body shape, request type.
    let tenant = tenant_from_host(&headers)
        .ok_or_else(|| ApiError::invalid_request("missing Host header"))?;
    let body = MessagesBody::parse(&raw_body)?;
    let request_type = classify_request(&body);

    // AUTHED: client bearer token against the tenant's configured key. An
    // unknown tenant reads as 404 before auth state — a missing token on a
    // nonexistent tenant is still "not found", not "unauthorized".
    if state.config.auth.enable_client_auth {
        let presented = extract_bearer(&headers).unwrap_or_default();
        state
            .credentials
            .validate_client_auth(&tenant, presented)
            .await?;
    }

    // RESOLVED: a currently valid upstream credential.
    let credential = state.credentials.resolve(&tenant).await?;

    info!(
        request_id = %request_id,
        tenant = %tenant,
        model = %body.model,
        request_type = request_type.as_str(),
        stream = body.stream,
        "proxying request"
    );

    // DISPATCHED: hashes, linkage, pre-response row.
    let hashes = prism_hash::hash_messages(&body.messages);
    let system_hash = prism_hash::hash_system(body.system.as_ref());
    let linkage = state.linker.link(&tenant, &body, &hashes, received_at);

    let request_value: serde_json::Value =
        serde_json::from_slice(&raw_body).unwrap_or(serde_json::Value::Null);
    state
        .pipeline
        .enqueue(WriteItem::InsertRequest(Box::new(RequestRecord {
            request_id: request_id.clone(),
            domain: tenant.clone(),
            account_id: credential.account_id.clone(),
            timestamp: received_at,
            model: Some(body.model.clone()),
            request_type,
            request_body: request_value,
            response_streaming: body.stream,
            conversation_id: Some(linkage.conversation_id.clone()),
            branch_id: Some(linkage.branch_id.clone()),
            message_count: Some(linkage.message_count),
            parent_request_id: linkage.parent_request_id.clone(),
            current_message_hash: Some(hashes.current.clone()),
            parent_message_hash: linkage.parent_message_hash.clone(),
            system_hash,
            parent_task_request_id: linkage.parent_task_request_id.clone(),
            is_subtask: linkage.is_subtask,
        })))
        .await;

    // Upstream call. The body passes through byte-for-byte.
    let upstream_result = build_upstream_request(&state, &headers, &credential.auth, raw_body)
        .timeout(std::time::Duration::from_millis(
            state.config.upstream.claude_api_timeout_ms,
        ))
        .send()
        .await;

    let upstream_resp = match upstream_result {
        Ok(resp) => resp,
        Err(e) => {
            let message = if e.is_timeout() {
                "upstream timeout"
            } else {
                "upstream connection error"
            };
            warn!(request_id = %request_id, error = %e, "upstream dispatch failed");
            finalize_error(&state, &request_id, started, None, &format!("upstream_error: {e}"))
                .await;
            return Err(ApiError::new(ErrorKind::Upstream, message));
        }
    };

    let status = upstream_resp.status();

    if !status.is_success() {
        return Ok(relay_upstream_error(&state, request_id, started, upstream_resp).await);
    }

    if body.stream {
        // STREAMING: raw bytes to the client, parsed events to storage.
        let response_headers = passthrough_headers(upstream_resp.headers());
        let (client_tx, client_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(64);

        let tee = stream::StreamTee::new(
            state.pipeline.clone(),
            request_id.clone(),
            started,
        );
        tokio::spawn(tee.run(Box::pin(upstream_resp.bytes_stream()), client_tx));

        let mut builder = Response::builder().status(StatusCode::OK);
        if let Some(headers_mut) = builder.headers_mut() {
            *headers_mut = response_headers;
        }
        builder
            .body(Body::from_stream(ReceiverStream::new(client_rx)))
            .map_err(|_| ApiError::internal())
    } else {
        // BUFFERED: read the full JSON, account, patch, forward.
        Ok(relay_buffered(&state, request_id, started, upstream_resp).await)
    }
}

/// Compose the upstream request: verbatim body, filtered headers, and the
/// tenant's auth headers. OAuth tenants get the provider's beta header.
fn build_upstream_request(
    state: &AppState,
    headers: &HeaderMap,
    auth: &UpstreamAuth,
    body: Bytes,
) -> reqwest::RequestBuilder {
    let url = format!("{}/v1/messages", state.config.upstream.base_url);
    let mut builder = state
        .upstream
        .post(&url)
        .header("content-type", "application/json")
        .body(body);

    if headers.get("anthropic-version").is_none() {
        builder = builder.header("anthropic-version", API_VERSION);
    }

    for (name, value) in headers.iter() {
        let name_str = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&name_str)
            || name_str == "content-type"
            || name_str == "content-length"
            || name_str == "authorization"
            || name_str == "x-api-key"
            || name_str == "x-dashboard-key"
        {
            continue;
        }
        builder = builder.header(name, value);
    }

    match auth {
        UpstreamAuth::ApiKey(key) => builder.header("x-api-key", key),
        UpstreamAuth::OAuth { access_token } => builder
            .header("authorization", format!("Bearer {access_token}"))
            .header("anthropic-beta", OAUTH_BETA),
    }
}

/// Upstream response headers the client should see — everything except
/// hop-by-hop. Rate-limit headers pass through here.
fn passthrough_headers(upstream: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream.iter() {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_ref()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert(name, value);
        }
    }
    out
}

/// Buffered (non-streaming) completion: parse usage and tool calls, patch
/// the row, forward the body untouched.
async fn relay_buffered(
    state: &AppState,
    request_id: String,
    started: Instant,
    upstream_resp: reqwest::Response,
) -> Response {
    let status = upstream_resp.status();
    let response_headers = passthrough_headers(upstream_resp.headers());

    let bytes = match upstream_resp.bytes().await {
        Ok(b) => b,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "upstream body read failed");
            finalize_error(state, &request_id, started, Some(status.as_u16()), &format!("upstream_error: {e}"))
                .await;
            return ApiError::new(ErrorKind::Upstream, "upstream read error").into_response();
        }
    };

    let response_value: Option<serde_json::Value> = serde_json::from_slice(&bytes).ok();
    let usage: TokenUsage = response_value
        .as_ref()
        .and_then(|v| v.get("usage"))
        .and_then(|u| serde_json::from_value(u.clone()).ok())
        .unwrap_or_default();
    let tool_calls = response_value.as_ref().map(count_tool_calls).unwrap_or(0);
    let task_invocation = response_value.as_ref().and_then(extract_task_invocations);

    debug!(
        request_id = %request_id,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        "buffered response complete"
    );

    state
        .pipeline
        .enqueue(WriteItem::PatchRequest(Box::new(RequestPatch {
            request_id,
            response_body: response_value,
            response_status: Some(status.as_u16()),
            input_tokens: Some(usage.input_tokens),
            output_tokens: Some(usage.output_tokens),
            cache_creation_tokens: Some(usage.cache_creation_input_tokens),
            cache_read_tokens: Some(usage.cache_read_input_tokens),
            first_token_ms: None,
            duration_ms: Some(started.elapsed().as_millis() as u64),
            error: None,
            tool_call_count: Some(tool_calls),
            task_tool_invocation: task_invocation,
        })))
        .await;

    let mut builder = Response::builder().status(status.as_u16());
    if let Some(headers_mut) = builder.headers_mut() {
        *headers_mut = response_headers;
    }
    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| ApiError::internal().into_response())
}

/// Upstream returned non-2xx. A structured error body passes through
/// verbatim (the tenant is authenticated by now); anything else becomes a
/// generic envelope. Either way the row records the failure.
async fn relay_upstream_error(
    state: &AppState,
    request_id: String,
    started: Instant,
    upstream_resp: reqwest::Response,
) -> Response {
    let status = upstream_resp.status();
    let response_headers = passthrough_headers(upstream_resp.headers());
    let bytes = upstream_resp.bytes().await.unwrap_or_default();

    let structured: Option<serde_json::Value> = serde_json::from_slice(&bytes)
        .ok()
        .filter(|v: &serde_json::Value| v.get("error").is_some());

    let error_text = prism_core::redact::redact_secrets(&format!(
        "upstream returned {}: {}",
        status.as_u16(),
        String::from_utf8_lossy(&bytes[..bytes.len().min(512)])
    ));
    warn!(request_id = %request_id, status = status.as_u16(), "upstream error response");
    finalize_error(state, &request_id, started, Some(status.as_u16()), &error_text).await;

    match structured {
        Some(body) => {
            let mut builder = Response::builder().status(status.as_u16());
            if let Some(headers_mut) = builder.headers_mut() {
                *headers_mut = response_headers;
            }
            builder
                .body(Body::from(body.to_string()))
                .unwrap_or_else(|_| ApiError::internal().into_response())
        }
        None => {
            let kind = match status.as_u16() {
                429 => ErrorKind::RateLimit,
                _ => ErrorKind::Upstream,
            };
            ApiError::new(kind, format!("upstream returned {}", status.as_u16()))
                .into_response()
        }
    }
}

/// Patch the row for a request that failed before producing a usable
/// response body.
async fn finalize_error(
    state: &AppState,
    request_id: &str,
    started: Instant,
    status: Option<u16>,
    error: &str,
) {
    state
        .pipeline
        .enqueue(WriteItem::PatchRequest(Box::new(RequestPatch {
            request_id: request_id.to_string(),
            response_status: status,
            duration_ms: Some(started.elapsed().as_millis() as u64),
            error: Some(prism_core::redact::redact_secrets(error)),
            ..Default::default()
        })))
        .await;
}

/// Task tool_use blocks from a response body, stored for the sub-task
/// look-back.
pub(crate) fn extract_task_invocations(response: &serde_json::Value) -> Option<serde_json::Value> {
    let blocks = response.get("content")?.as_array()?;
    let tasks: Vec<serde_json::Value> = blocks
        .iter()
        .filter(|b| {
            b.get("type").and_then(|t| t.as_str()) == Some("tool_use")
                && b.get("name").and_then(|n| n.as_str()) == Some("Task")
        })
        .cloned()
        .collect();
    if tasks.is_empty() {
        None
    } else {
        Some(serde_json::Value::Array(tasks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_invocations_extracted_only_for_task_tools() {
        let resp = serde_json::json!({
            "content": [
                {"type": "text", "text": "working on it"},
                {"type": "tool_use", "id": "t1", "name": "Task", "input": {"prompt": "do X"}},
                {"type": "tool_use", "id": "t2", "name": "Bash", "input": {"command": "ls"}},
            ]
        });
        let tasks = extract_task_invocations(&resp).expect("has task");
        let arr = tasks.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["input"]["prompt"], "do X");
    }

    #[test]
    fn no_task_blocks_yields_none() {
        let resp = serde_json::json!({"content": [{"type": "text", "text": "hi"}]});
        assert!(extract_task_invocations(&resp).is_none());
    }
}
