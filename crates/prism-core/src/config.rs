use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Top-level config (prism.toml + PRISM_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrismConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

impl Default for PrismConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            credentials: CredentialsConfig::default(),
            database: DatabaseConfig::default(),
            upstream: UpstreamConfig::default(),
            pipeline: PipelineConfig::default(),
            analysis: AnalysisConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Server-side response deadline. Must stay strictly above the upstream
    /// timeout so persistence finishes before the socket is cut.
    #[serde(default = "default_proxy_server_timeout_ms")]
    pub proxy_server_timeout_ms: u64,
    /// Drain window for in-flight requests on shutdown.
    #[serde(default = "default_shutdown_drain_ms")]
    pub shutdown_drain_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            proxy_server_timeout_ms: default_proxy_server_timeout_ms(),
            shutdown_drain_ms: default_shutdown_drain_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// When false the client bearer-token check on /v1/messages is skipped.
    #[serde(default = "bool_true")]
    pub enable_client_auth: bool,
    /// Shared secret for the dashboard read API. When unset, dashboard
    /// endpoints reject every request.
    pub dashboard_api_key: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enable_client_auth: true,
            dashboard_api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Directory holding one JSON credential file per tenant.
    #[serde(default = "default_credentials_dir")]
    pub credentials_dir: String,
    /// Refresh OAuth tokens when remaining lifetime drops below this.
    #[serde(default = "default_refresh_lead_secs")]
    pub oauth_refresh_lead_secs: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            credentials_dir: default_credentials_dir(),
            oauth_refresh_lead_secs: default_refresh_lead_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// When false, nothing is persisted — the proxy still forwards.
    #[serde(default = "bool_true")]
    pub storage_enabled: bool,
    /// Reads slower than this log at warn level.
    #[serde(default = "default_slow_query_threshold_ms")]
    pub slow_query_threshold_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            storage_enabled: true,
            slow_query_threshold_ms: default_slow_query_threshold_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,
    /// Upstream request timeout.
    #[serde(default = "default_claude_api_timeout_ms")]
    pub claude_api_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            claude_api_timeout_ms: default_claude_api_timeout_ms(),
        }
    }
}

/// Write-pipeline knobs. The defaults match the documented batching and
/// back-pressure contract; override only for test harnesses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// How long a producer may block on a full queue before dropping.
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
    #[serde(default = "default_shutdown_flush_timeout_ms")]
    pub shutdown_flush_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            shutdown_flush_timeout_ms: default_shutdown_flush_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "bool_true")]
    pub ai_worker_enabled: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub ai_worker_poll_interval_ms: u64,
    #[serde(default = "default_max_concurrent_jobs")]
    pub ai_worker_max_concurrent_jobs: usize,
    #[serde(default = "default_max_retries")]
    pub ai_analysis_max_retries: u32,
    #[serde(default = "default_analysis_timeout_ms")]
    pub ai_analysis_timeout_ms: u64,
    #[serde(default = "default_max_prompt_tokens")]
    pub ai_analysis_max_prompt_tokens: usize,
    #[serde(default = "default_head_messages")]
    pub ai_head_messages: usize,
    #[serde(default = "default_tail_messages")]
    pub ai_tail_messages: usize,
    /// Sweep cadence for jobs stuck in `processing`.
    #[serde(default = "default_stuck_sweep_interval_ms")]
    pub stuck_sweep_interval_ms: u64,
    /// A `processing` row older than this is considered stuck.
    #[serde(default = "default_stuck_threshold_ms")]
    pub stuck_threshold_ms: u64,
    #[serde(default = "default_analysis_base_url")]
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_analysis_model")]
    pub model: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            ai_worker_enabled: true,
            ai_worker_poll_interval_ms: default_poll_interval_ms(),
            ai_worker_max_concurrent_jobs: default_max_concurrent_jobs(),
            ai_analysis_max_retries: default_max_retries(),
            ai_analysis_timeout_ms: default_analysis_timeout_ms(),
            ai_analysis_max_prompt_tokens: default_max_prompt_tokens(),
            ai_head_messages: default_head_messages(),
            ai_tail_messages: default_tail_messages(),
            stuck_sweep_interval_ms: default_stuck_sweep_interval_ms(),
            stuck_threshold_ms: default_stuck_threshold_ms(),
            base_url: default_analysis_base_url(),
            api_key: None,
            model: default_analysis_model(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_proxy_server_timeout_ms() -> u64 {
    11 * 60 * 1000
}
fn default_shutdown_drain_ms() -> u64 {
    30_000
}
fn default_credentials_dir() -> String {
    "credentials".to_string()
}
fn default_refresh_lead_secs() -> u64 {
    60
}
fn default_database_url() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.prism/prism.db", home)
}
fn default_slow_query_threshold_ms() -> u64 {
    5000
}
fn default_upstream_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_claude_api_timeout_ms() -> u64 {
    10 * 60 * 1000
}
fn default_queue_capacity() -> usize {
    10_000
}
fn default_batch_size() -> usize {
    100
}
fn default_flush_interval_ms() -> u64 {
    1000
}
fn default_enqueue_timeout_ms() -> u64 {
    500
}
fn default_shutdown_flush_timeout_ms() -> u64 {
    30_000
}
fn default_poll_interval_ms() -> u64 {
    5000
}
fn default_max_concurrent_jobs() -> usize {
    3
}
fn default_max_retries() -> u32 {
    3
}
fn default_analysis_timeout_ms() -> u64 {
    60_000
}
fn default_max_prompt_tokens() -> usize {
    855_000
}
fn default_head_messages() -> usize {
    5
}
fn default_tail_messages() -> usize {
    20
}
fn default_stuck_sweep_interval_ms() -> u64 {
    60_000
}
fn default_stuck_threshold_ms() -> u64 {
    5 * 60 * 1000
}
fn default_analysis_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_analysis_model() -> String {
    "claude-haiku-4-5".to_string()
}
fn bool_true() -> bool {
    true
}

impl PrismConfig {
    /// Load config from a TOML file with PRISM_* env var overrides.
    ///
    /// Checks in order: explicit path argument, then ./prism.toml.
    /// Env vars use double underscores for nesting: PRISM_SERVER__PORT=8080.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("prism.toml");

        let config: PrismConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PRISM_").split("__"))
            .extract()
            .map_err(|e| crate::error::PrismError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would misbehave at runtime.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.server.proxy_server_timeout_ms <= self.upstream.claude_api_timeout_ms {
            return Err(crate::error::PrismError::Config(format!(
                "proxy_server_timeout_ms ({}) must exceed claude_api_timeout_ms ({})",
                self.server.proxy_server_timeout_ms, self.upstream.claude_api_timeout_ms
            )));
        }
        if self.pipeline.batch_size == 0 || self.pipeline.queue_capacity == 0 {
            return Err(crate::error::PrismError::Config(
                "pipeline batch_size and queue_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        PrismConfig::default().validate().expect("defaults valid");
    }

    #[test]
    fn server_deadline_must_exceed_upstream_timeout() {
        let mut cfg = PrismConfig::default();
        cfg.server.proxy_server_timeout_ms = cfg.upstream.claude_api_timeout_ms;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_timeouts_match_contract() {
        let cfg = PrismConfig::default();
        assert_eq!(cfg.upstream.claude_api_timeout_ms, 600_000);
        assert_eq!(cfg.server.proxy_server_timeout_ms, 660_000);
        assert_eq!(cfg.analysis.ai_analysis_max_prompt_tokens, 855_000);
    }
}
