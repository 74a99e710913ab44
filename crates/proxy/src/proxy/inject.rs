// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-request credential selection.

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::Utc;

use crate::proxy::ProxyState;

/// Credential-management paths. These always use bearer auth so a leaked
/// static key cannot mint new keys.
const MANAGEMENT_PREFIXES: &[&str] =
    &["/key/", "/keys", "/api-keys", "/v1/keys", "/v1/api-keys", "/api/keys"];

/// The credential attached to one outbound request.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    ApiKey { header: HeaderName, value: String },
    Bearer(String),
    /// Nothing usable on disk; forwarded unauthenticated.
    Missing,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey { header, .. } => write!(f, "ApiKey({header})"),
            Self::Bearer(_) => f.write_str("Bearer(..)"),
            Self::Missing => f.write_str("Missing"),
        }
    }
}

pub fn is_management_path(path: &str) -> bool {
    MANAGEMENT_PREFIXES.iter().any(|prefix| {
        path.strip_prefix(prefix)
            .is_some_and(|rest| prefix.ends_with('/') || rest.is_empty() || rest.starts_with('/'))
    })
}

/// Pick the credential for a request to `path`.
pub async fn resolve_credential(state: &ProxyState, path: &str) -> Credential {
    if !is_management_path(path) {
        if let Some(key) = &state.settings.api_key {
            return Credential::ApiKey {
                header: state.settings.api_key_header.clone(),
                value: key.clone(),
            };
        }
    }
    match bearer_token(state).await {
        Some(token) => Credential::Bearer(token),
        None => Credential::Missing,
    }
}

/// Current ID token, refreshed inline when expired.
///
/// A failed refresh still yields the stale token so the upstream's
/// rejection reaches the caller.
async fn bearer_token(state: &ProxyState) -> Option<String> {
    let token = match state.store.load() {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(err = %e, "no token available, forwarding without credentials; run `authproxy login`");
            return None;
        }
    };

    if token.is_expired() {
        if let Some(refresher) = &state.refresher {
            match refresher.refresh_from(&token).await {
                Ok(_) => match state.store.load() {
                    Ok(fresh) if !fresh.is_expired() => return Some(fresh.id_token),
                    Ok(_) => tracing::warn!("refresh completed but the stored token is still expired"),
                    Err(e) => tracing::warn!(err = %e, "cannot reload refreshed token"),
                },
                Err(failure) => tracing::warn!(kind = %failure.kind, err = %failure.message, "inline refresh failed"),
            }
        }
        let expired_mins = -token.expires_in(Utc::now()).num_minutes();
        tracing::warn!(
            expired_mins,
            expires_at = %token.expires_at,
            "forwarding with an EXPIRED token; the upstream will likely reject it; run `authproxy login`"
        );
        return Some(token.id_token);
    }

    if token.is_expiring_soon(state.settings.expiry_warning) {
        tracing::warn!(
            expires_in_secs = token.expires_in(Utc::now()).num_seconds(),
            "token expires soon"
        );
    }
    Some(token.id_token)
}

/// Replace any inbound auth headers with `credential`.
pub fn apply(headers: &mut HeaderMap, api_key_header: &HeaderName, credential: &Credential) {
    headers.remove(AUTHORIZATION);
    headers.remove(api_key_header);
    match credential {
        Credential::ApiKey { header, value } => match HeaderValue::from_str(value) {
            Ok(mut v) => {
                v.set_sensitive(true);
                headers.insert(header.clone(), v);
            }
            Err(_) => tracing::warn!(%header, "API key is not a valid header value, not attached"),
        },
        Credential::Bearer(token) => match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(mut v) => {
                v.set_sensitive(true);
                headers.insert(AUTHORIZATION, v);
            }
            Err(_) => tracing::warn!("token is not a valid header value, not attached"),
        },
        Credential::Missing => {}
    }
}

#[cfg(test)]
#[path = "inject_tests.rs"]
mod tests;
