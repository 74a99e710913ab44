// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token endpoint calls: authorization code exchange, refresh, and
//! endpoint discovery.

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::oauth::{Endpoints, OAuthConfig, OAuthError, TokenResponse};

/// Timeout for code exchange and refresh requests.
pub const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for fetching the discovery document.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Body fragments some providers use to signal throttling without a 429.
const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "rate_limit", "ratelimit", "too many requests"];

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    #[serde(default)]
    authorization_endpoint: Option<String>,
    #[serde(default)]
    token_endpoint: Option<String>,
}

/// OAuth client bound to one configuration.
pub struct OAuthClient {
    config: OAuthConfig,
    http: reqwest::Client,
    endpoints: OnceCell<Endpoints>,
}

impl std::fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClient").field("config", &self.config).finish_non_exhaustive()
    }
}

impl OAuthClient {
    pub fn new(config: OAuthConfig) -> anyhow::Result<Self> {
        crate::ensure_crypto();
        let http = reqwest::Client::builder().connect_timeout(Duration::from_secs(10)).build()?;
        Ok(Self { config, http, endpoints: OnceCell::new() })
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Authorization and token endpoints, discovering them from the issuer
    /// when either is not configured. Resolved at most once.
    pub async fn endpoints(&self) -> Result<&Endpoints, OAuthError> {
        self.endpoints.get_or_try_init(|| self.resolve_endpoints()).await
    }

    async fn resolve_endpoints(&self) -> Result<Endpoints, OAuthError> {
        if let (Some(authorize), Some(token)) =
            (&self.config.authorize_endpoint, &self.config.token_endpoint)
        {
            return Ok(Endpoints { authorize: authorize.clone(), token: token.clone() });
        }

        let Some(issuer) = self.config.issuer.as_deref() else {
            return Err(OAuthError::Discovery(
                "no issuer configured and authorize/token endpoints are incomplete".to_owned(),
            ));
        };
        let url = format!("{}/.well-known/openid-configuration", issuer.trim_end_matches('/'));
        tracing::debug!(%url, "discovering oauth endpoints");

        let resp = self
            .http
            .get(&url)
            .timeout(DISCOVERY_TIMEOUT)
            .send()
            .await
            .map_err(|e| OAuthError::Discovery(format!("{url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(OAuthError::Discovery(format!("{url} returned {}", resp.status())));
        }
        let doc: DiscoveryDocument =
            resp.json().await.map_err(|e| OAuthError::Discovery(format!("{url}: {e}")))?;

        let authorize = match &self.config.authorize_endpoint {
            Some(a) => a.clone(),
            None => doc.authorization_endpoint.ok_or_else(|| {
                OAuthError::Discovery("discovery document has no authorization_endpoint".to_owned())
            })?,
        };
        let token = match &self.config.token_endpoint {
            Some(t) => t.clone(),
            None => doc.token_endpoint.ok_or_else(|| {
                OAuthError::Discovery("discovery document has no token_endpoint".to_owned())
            })?,
        };
        Ok(Endpoints { authorize, token })
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, OAuthError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", self.config.client_id.as_str()),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", verifier),
        ];
        self.token_request(&form).await
    }

    /// Redeem a refresh token for a new token response.
    pub async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenResponse, OAuthError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];
        self.token_request(&form).await
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse, OAuthError> {
        let endpoint = &self.endpoints().await?.token;
        let resp =
            self.http.post(endpoint).form(form).timeout(TOKEN_REQUEST_TIMEOUT).send().await?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body));
        }
        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| OAuthError::Decode(format!("token response: {e}")))
    }
}

/// Map a non-200 token endpoint response to an error.
pub fn classify_status(status: u16, body: String) -> OAuthError {
    if status == 429 || has_rate_limit_marker(&body) {
        OAuthError::RateLimited { status, body }
    } else {
        OAuthError::RequestFailed { status, body }
    }
}

pub(crate) fn has_rate_limit_marker(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
