// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unverified ID token claim extraction.
//!
//! Signatures are not checked: the token came straight from the token
//! endpoint over TLS, and only `email` and `exp` are read for display
//! and scheduling.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::oauth::OAuthError;

#[derive(Debug, Default, Deserialize)]
struct Claims {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
}

/// The `email` claim of `token`.
pub fn extract_email(token: &str) -> Result<String, OAuthError> {
    decode_claims(token)?.email.filter(|e| !e.is_empty()).ok_or(OAuthError::MissingClaim("email"))
}

/// The `exp` claim of `token` as a UTC instant.
pub fn get_expiry(token: &str) -> Result<DateTime<Utc>, OAuthError> {
    let exp = decode_claims(token)?.exp.ok_or(OAuthError::MissingClaim("exp"))?;
    DateTime::from_timestamp(exp, 0)
        .ok_or_else(|| OAuthError::Decode(format!("exp {exp} out of range")))
}

fn decode_claims(token: &str) -> Result<Claims, OAuthError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(OAuthError::Decode(format!("expected 3 segments, found {}", parts.len())));
    }
    let payload = decode_segment(parts[1])?;
    serde_json::from_slice(&payload).map_err(|e| OAuthError::Decode(format!("claims: {e}")))
}

/// Decode a base64url segment, tolerating padding and standard alphabet.
fn decode_segment(segment: &str) -> Result<Vec<u8>, OAuthError> {
    if let Ok(bytes) = URL_SAFE_NO_PAD.decode(segment) {
        return Ok(bytes);
    }
    let mut padded: String = segment
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            c => c,
        })
        .collect();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    STANDARD.decode(padded).map_err(|e| OAuthError::Decode(format!("payload: {e}")))
}

#[cfg(test)]
#[path = "jwt_tests.rs"]
mod tests;
