//! Request authentication helpers: client bearer tokens on the proxy path,
//! shared-secret header on the dashboard path. All comparisons are
//! constant-time.

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use crate::app::AppState;
use crate::error::ApiError;

pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Tenant comes from the Host header; the port suffix is irrelevant.
pub fn tenant_from_host(headers: &HeaderMap) -> Option<String> {
    let host = headers.get("host").and_then(|v| v.to_str().ok())?;
    let host = host.split(':').next().unwrap_or(host).trim();
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

/// Dashboard auth: `X-Dashboard-Key` or `Authorization: Bearer`, compared
/// constant-time against the configured secret. No secret configured means
/// no access.
pub fn require_dashboard_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.config.auth.dashboard_api_key else {
        return Err(ApiError::authentication());
    };

    let presented = headers
        .get("x-dashboard-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| extract_bearer(headers));

    match presented {
        Some(key) if bool::from(expected.as_bytes().ct_eq(key.as_bytes())) => Ok(()),
        _ => Err(ApiError::authentication()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn bearer_extraction() {
        let h = headers(&[("authorization", "Bearer tok-123")]);
        assert_eq!(extract_bearer(&h), Some("tok-123"));

        let h = headers(&[("authorization", "Basic xyz")]);
        assert_eq!(extract_bearer(&h), None);
    }

    #[test]
    fn host_strips_port_and_lowercases() {
        let h = headers(&[("host", "Tenant.Example.com:8443")]);
        assert_eq!(tenant_from_host(&h).as_deref(), Some("tenant.example.com"));
    }

    #[test]
    fn missing_host_is_none() {
        assert!(tenant_from_host(&HeaderMap::new()).is_none());
    }
}
