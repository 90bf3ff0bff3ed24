use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};

use prism_core::PrismConfig;
use prism_credentials::CredentialStore;
use prism_linker::Linker;
use prism_storage::{AnalysisStore, RequestStore, WritePipeline};

/// Central shared state — passed as Arc<AppState> to all axum handlers.
/// Every subsystem is initialized once at startup; nothing holds a
/// back-pointer to anything else.
pub struct AppState {
    pub config: PrismConfig,
    pub credentials: Arc<CredentialStore>,
    pub pipeline: WritePipeline,
    pub requests: Arc<RequestStore>,
    pub analyses: Arc<AnalysisStore>,
    pub linker: Linker,
    /// Shared upstream HTTP client; per-request timeouts are applied at the
    /// call site so streaming and buffered paths can differ.
    pub upstream: reqwest::Client,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: PrismConfig,
        credentials: Arc<CredentialStore>,
        pipeline: WritePipeline,
        requests: Arc<RequestStore>,
        analyses: Arc<AnalysisStore>,
    ) -> Self {
        let linker = Linker::new(Arc::clone(&requests));
        Self {
            config,
            credentials,
            pipeline,
            requests,
            analyses,
            linker,
            upstream: reqwest::Client::new(),
            started_at: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Assemble the full axum router: the proxied LLM surface plus the
/// dashboard read API.
///
/// The server-side deadline sits strictly above the upstream timeout
/// (enforced at config validation), so a hung upstream is always cut by the
/// proxy first and persistence still completes. Streaming bodies are not
/// subject to the layer — the tee task owns their lifecycle.
pub fn build_router(state: Arc<AppState>) -> Router {
    let deadline =
        std::time::Duration::from_millis(state.config.server.proxy_server_timeout_ms);
    Router::new()
        .route("/v1/messages", post(crate::proxy::messages_handler))
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/token-stats",
            get(crate::http::usage::token_stats_handler),
        )
        .route("/api/requests", get(crate::http::requests::list_handler))
        .route(
            "/api/requests/{id}",
            get(crate::http::requests::detail_handler),
        )
        .route(
            "/api/conversations",
            get(crate::http::conversations::list_handler),
        )
        .route(
            "/api/conversations/{id}",
            get(crate::http::conversations::detail_handler),
        )
        .route(
            "/api/token-usage/current",
            get(crate::http::usage::current_handler),
        )
        .route(
            "/api/token-usage/daily",
            get(crate::http::usage::daily_handler),
        )
        .route("/api/analyses", post(crate::http::analyses::create_handler))
        .route(
            "/api/analyses/{conversation_id}/{branch_id}",
            get(crate::http::analyses::get_handler),
        )
        .route(
            "/api/analyses/{conversation_id}/{branch_id}/regenerate",
            post(crate::http::analyses::regenerate_handler),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::timeout::TimeoutLayer::new(deadline))
}
