// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OAuth authorization code + PKCE (RFC 7636) helpers.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};
use url::Url;

use crate::oauth::{OAuthError, SCOPES};

/// One login attempt's PKCE material. Never persisted.
#[derive(Clone)]
pub struct PkceSession {
    pub verifier: String,
    pub challenge: String,
    /// CSRF token echoed back on the redirect.
    pub state: String,
}

impl PkceSession {
    pub fn generate() -> Self {
        let (verifier, challenge) = generate_pkce();
        Self { verifier, challenge, state: generate_state() }
    }
}

impl std::fmt::Debug for PkceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceSession").field("challenge", &self.challenge).finish_non_exhaustive()
    }
}

/// Generate `(verifier, challenge)`: 32 random bytes, base64url without padding,
/// and the S256 challenge of that verifier.
pub fn generate_pkce() -> (String, String) {
    let verifier = generate_code_verifier();
    let challenge = compute_code_challenge(&verifier);
    (verifier, challenge)
}

/// Generate a PKCE code verifier (32 bytes → 43 URL-safe chars).
pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compute code_challenge = base64url_nopad(sha256(verifier)).
pub fn compute_code_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generate a random state parameter (16 bytes → 22 chars).
pub fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build the authorization URL for a login attempt.
pub fn build_authorization_url(
    authorize_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    session: &PkceSession,
) -> Result<Url, OAuthError> {
    let mut url = Url::parse(authorize_endpoint)
        .map_err(|e| OAuthError::Discovery(format!("invalid authorization endpoint: {e}")))?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("scope", SCOPES)
        .append_pair("state", &session.state)
        .append_pair("code_challenge", &session.challenge)
        .append_pair("code_challenge_method", "S256");
    Ok(url)
}

#[cfg(test)]
#[path = "pkce_tests.rs"]
mod tests;
