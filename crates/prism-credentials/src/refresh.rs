//! OAuth refresh-token exchange against the provider's token endpoint.

use serde::Deserialize;
use tracing::debug;

use crate::error::{CredentialError, Result};
use crate::types::OAuthTokens;

const TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

pub struct TokenRefresher {
    client: reqwest::Client,
    token_url: String,
}

impl TokenRefresher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url: TOKEN_URL.to_string(),
        }
    }

    pub fn with_token_url(token_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url: token_url.into(),
        }
    }

    /// Exchange a refresh token for a new token set. The provider may or may
    /// not rotate the refresh token; keep the old one when it doesn't.
    pub async fn refresh(&self, current: &OAuthTokens) -> Result<OAuthTokens> {
        let body = format!(
            "grant_type=refresh_token&refresh_token={}&client_id={}",
            urlencoding::encode(&current.refresh_token),
            CLIENT_ID
        );

        let resp = self
            .client
            .post(&self.token_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Accept", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| CredentialError::RefreshFailed(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            // The response body may echo token material — never propagate it.
            return Err(CredentialError::RefreshFailed(format!(
                "token endpoint returned {status}"
            )));
        }

        let token_resp: TokenRefreshResponse = resp
            .json()
            .await
            .map_err(|e| CredentialError::RefreshFailed(e.to_string()))?;

        let now = chrono::Utc::now().timestamp_millis();
        debug!(expires_in = token_resp.expires_in, "OAuth token refreshed");

        Ok(OAuthTokens {
            access_token: token_resp.access_token,
            refresh_token: token_resp
                .refresh_token
                .unwrap_or_else(|| current.refresh_token.clone()),
            expires_at: now + (token_resp.expires_in as i64 * 1000),
            scopes: current.scopes.clone(),
        })
    }
}

impl Default for TokenRefresher {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct TokenRefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}
