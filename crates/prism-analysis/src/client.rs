//! HTTP client for the external analysis model.

use serde::Deserialize;
use tracing::debug;

use crate::error::{AnalysisError, Result};

const API_VERSION: &str = "2023-06-01";
const MAX_COMPLETION_TOKENS: u32 = 8192;

pub struct AnalysisClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

/// A completed analysis call: raw text plus the usage the provider billed.
#[derive(Debug)]
pub struct AnalysisOutcome {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl AnalysisClient {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model: String,
        timeout_ms: u64,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| AnalysisError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            api_key,
            model,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn analyze(&self, prompt: &str) -> Result<AnalysisOutcome> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": MAX_COMPLETION_TOKENS,
            "messages": [{"role": "user", "content": prompt}],
        });

        debug!(model = %self.model, prompt_bytes = prompt.len(), "calling analysis model");

        let mut builder = self
            .client
            .post(&url)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AnalysisError::Timeout
            } else {
                AnalysisError::Transport(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(AnalysisError::Api {
                status,
                message: prism_core::redact::redact_secrets(&message),
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| AnalysisError::Transport(e.to_string()))?;

        let text = api_resp
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(AnalysisOutcome {
            text,
            prompt_tokens: api_resp.usage.input_tokens,
            completion_tokens: api_resp.usage.output_tokens,
        })
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}
