// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OAuth2/OIDC client pieces: PKCE, token endpoint calls, ID token claims,
//! and the loopback redirect listener.

pub mod callback;
pub mod client;
pub mod jwt;
pub mod pkce;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::store::TokenSet;

pub use client::OAuthClient;

/// Scopes requested during interactive login.
pub const SCOPES: &str = "openid email profile";

/// OAuth client settings.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    /// Issuer base URL, used for `.well-known/openid-configuration` discovery.
    pub issuer: Option<String>,
    pub authorize_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    /// Loopback port for the redirect listener (0 picks an ephemeral port).
    pub callback_port: u16,
}

/// Resolved authorization and token endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub authorize: String,
    pub token: String,
}

/// Standard OAuth2 token response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub id_token: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

/// Errors from the OAuth endpoints and token decoding.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    /// HTTP 429 or a body carrying a rate-limit marker.
    #[error("rate limited by token endpoint ({status}): {body}")]
    RateLimited { status: u16, body: String },
    #[error("token request failed ({status}): {body}")]
    RequestFailed { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed token: {0}")]
    Decode(String),
    #[error("token is missing the {0:?} claim")]
    MissingClaim(&'static str),
    #[error("endpoint discovery failed: {0}")]
    Discovery(String),
    #[error("state mismatch in OAuth callback (possible CSRF)")]
    StateMismatch,
    #[error("authorization failed: {0}")]
    Callback(#[from] callback::CallbackError),
}

impl TokenSet {
    /// Build a token set from a token endpoint response.
    ///
    /// `expires_at` comes from the ID token's `exp` claim when decodable,
    /// falling back to `issued_at + expires_in`. A response without a
    /// refresh token keeps `previous_refresh`.
    pub fn from_response(
        resp: TokenResponse,
        previous_refresh: Option<&str>,
        issued_at: DateTime<Utc>,
    ) -> Result<Self, OAuthError> {
        if resp.id_token.is_empty() {
            return Err(OAuthError::MissingClaim("id_token"));
        }

        let expires_at = match jwt::get_expiry(&resp.id_token) {
            Ok(exp) => exp,
            Err(e) => {
                tracing::debug!(err = %e, "id_token exp unavailable, using expires_in");
                let lifetime = TimeDelta::seconds(i64::try_from(resp.expires_in).unwrap_or(i64::MAX));
                issued_at.checked_add_signed(lifetime).unwrap_or(issued_at)
            }
        };

        let email = jwt::extract_email(&resp.id_token).unwrap_or_else(|e| {
            tracing::debug!(err = %e, "id_token carries no email");
            String::new()
        });

        let refresh_token = match resp.refresh_token.filter(|r| !r.is_empty()) {
            Some(r) => r,
            None => previous_refresh.map(str::to_owned).unwrap_or_default(),
        };

        Ok(Self {
            id_token: resp.id_token,
            access_token: resp.access_token,
            refresh_token,
            expires_at,
            email,
        })
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
