use serde::{Deserialize, Serialize};

/// On-disk shape of a tenant credential file (one JSON file per tenant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialFile {
    #[serde(rename = "type")]
    pub credential_type: CredentialType,
    pub account_id: String,
    /// Shared secret presented by clients of this tenant.
    pub client_api_key: String,
    /// Upstream api key; present for `api_key` credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// OAuth token set; present for `oauth` credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthTokens>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    ApiKey,
    Oauth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry as epoch milliseconds.
    pub expires_at: i64,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OAuthTokens {
    /// A token is usable only while `now + lead` stays below expiry.
    pub fn fresh_at(&self, now_ms: i64, lead_ms: i64) -> bool {
        now_ms + lead_ms < self.expires_at
    }

    /// Hard-expired: past expiry with no lead applied.
    pub fn expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }
}

/// What the proxy needs to call upstream on a tenant's behalf. The raw
/// secret lives only here and in the auth header it composes.
#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub tenant: String,
    pub account_id: String,
    pub auth: UpstreamAuth,
}

#[derive(Debug, Clone)]
pub enum UpstreamAuth {
    ApiKey(String),
    OAuth { access_token: String },
}
