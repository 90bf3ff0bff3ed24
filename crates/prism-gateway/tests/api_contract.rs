// Wire-contract tests for the assembled router: error envelope shapes,
// status codes, and dashboard auth. No upstream provider is involved —
// the one dispatch test points at an unroutable address.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use prism_core::PrismConfig;
use prism_credentials::CredentialStore;
use prism_gateway::app::{build_router, AppState};
use prism_storage::{AnalysisStore, RequestStore, WritePipeline};

const DASHBOARD_KEY: &str = "dash-secret-1234";
const CLIENT_KEY: &str = "client-key-5678";

fn test_state(upstream_base: &str) -> (tempfile::TempDir, Arc<AppState>) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("tenant.example.json"),
        format!(
            r#"{{"type":"api_key","account_id":"acct-1","client_api_key":"{CLIENT_KEY}","api_key":"sk-upstream-000"}}"#
        ),
    )
    .unwrap();

    let mut config = PrismConfig::default();
    config.auth.dashboard_api_key = Some(DASHBOARD_KEY.to_string());
    config.credentials.credentials_dir = dir.path().to_str().unwrap().to_string();
    config.upstream.base_url = upstream_base.to_string();

    let credentials = Arc::new(CredentialStore::new(dir.path(), 60));
    credentials.scan().unwrap();

    let reader_conn = prism_storage::open(":memory:").unwrap();
    prism_storage::init_db(&reader_conn).unwrap();
    let analysis_conn = prism_storage::open(":memory:").unwrap();
    prism_storage::init_db(&analysis_conn).unwrap();

    let state = Arc::new(AppState::new(
        config,
        credentials,
        WritePipeline::disabled(),
        Arc::new(RequestStore::new(reader_conn, 5000)),
        Arc::new(AnalysisStore::new(analysis_conn)),
    ));
    (dir, state)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn messages_request(host: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("host", host)
        .header("content-type", "application/json");
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder
        .body(Body::from(
            r#"{"model":"model-1","messages":[{"role":"user","content":"hello"}]}"#,
        ))
        .unwrap()
}

#[tokio::test]
async fn unknown_tenant_returns_404_envelope() {
    let (_dir, state) = test_state("http://127.0.0.1:1");
    let router = build_router(state);

    let response = router
        .oneshot(messages_request("unknown.example", Some(CLIENT_KEY)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "not_found_error");
}

#[tokio::test]
async fn unknown_tenant_is_404_even_without_bearer() {
    let (_dir, state) = test_state("http://127.0.0.1:1");
    let router = build_router(state);

    let response = router
        .oneshot(messages_request("unknown.example", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bad_client_key_returns_401() {
    let (_dir, state) = test_state("http://127.0.0.1:1");
    let router = build_router(state);

    let response = router
        .oneshot(messages_request("tenant.example", Some("wrong-key")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn unreachable_upstream_returns_502_envelope() {
    let (_dir, state) = test_state("http://127.0.0.1:1");
    let router = build_router(state);

    let response = router
        .oneshot(messages_request("tenant.example", Some(CLIENT_KEY)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "upstream_error");
    // Credential material must never leak into error bodies.
    let text = json.to_string();
    assert!(!text.contains("sk-upstream-000"));
    assert!(!text.contains(CLIENT_KEY));
}

#[tokio::test]
async fn missing_host_header_is_invalid_request() {
    let (_dir, state) = test_state("http://127.0.0.1:1");
    let router = build_router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"model":"m","messages":[]}"#))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_body_is_invalid_request() {
    let (_dir, state) = test_state("http://127.0.0.1:1");
    let router = build_router(state);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("host", "tenant.example")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn dashboard_endpoints_require_the_shared_secret() {
    let (_dir, state) = test_state("http://127.0.0.1:1");
    let router = build_router(state);

    let request = Request::builder()
        .uri("/api/requests")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/api/requests")
        .header("x-dashboard-key", DASHBOARD_KEY)
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert!(json["requests"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn dashboard_accepts_bearer_form() {
    let (_dir, state) = test_state("http://127.0.0.1:1");
    let router = build_router(state);

    let request = Request::builder()
        .uri("/health")
        .header("authorization", format!("Bearer {DASHBOARD_KEY}"))
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].as_str().is_some());
}

#[tokio::test]
async fn analysis_create_conflicts_on_second_call() {
    let (_dir, state) = test_state("http://127.0.0.1:1");
    let router = build_router(state);

    let make_request = || {
        Request::builder()
            .method("POST")
            .uri("/api/analyses")
            .header("x-dashboard-key", DASHBOARD_KEY)
            .header("content-type", "application/json")
            .body(Body::from(r#"{"conversationId":"conv-1"}"#))
            .unwrap()
    };

    let response = router.clone().oneshot(make_request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert_eq!(json["analysis"]["status"], "pending");
    assert_eq!(json["analysis"]["branchId"], "main");

    let response = router.oneshot(make_request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn analysis_get_unknown_is_404() {
    let (_dir, state) = test_state("http://127.0.0.1:1");
    let router = build_router(state);

    let request = Request::builder()
        .uri("/api/analyses/conv-missing/main")
        .header("x-dashboard-key", DASHBOARD_KEY)
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn token_usage_current_requires_account() {
    let (_dir, state) = test_state("http://127.0.0.1:1");
    let router = build_router(state);

    let request = Request::builder()
        .uri("/api/token-usage/current?accountId=acct-1&window=60")
        .header("x-dashboard-key", DASHBOARD_KEY)
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["usage"]["requestCount"], 0);
    assert_eq!(json["usage"]["totalTokens"], 0);
}
