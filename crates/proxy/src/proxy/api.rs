// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local side-channel endpoints. Never forwarded upstream.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::proxy::ProxyState;
use crate::refresher::backoff::FailureKind;
use crate::refresher::{Phase, ReauthOutcome, RefresherStatus};
use crate::store::{StoreError, TokenSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSummary {
    pub present: bool,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Negative once expired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TokenSummary {
    pub fn from_load(result: &Result<TokenSet, StoreError>, now: DateTime<Utc>) -> Self {
        match result {
            Ok(t) => Self {
                present: true,
                valid: !t.is_expired_at(now),
                expires_at: Some(t.expires_at),
                expires_in_secs: Some(t.expires_in(now).num_seconds()),
                email: Some(t.email.clone()).filter(|e| !e.is_empty()),
                error: None,
            },
            Err(e) => Self {
                present: false,
                valid: false,
                expires_at: None,
                expires_in_secs: None,
                email: None,
                error: (!e.is_not_found()).then(|| e.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the background refresher has died.
    pub status: String,
    pub pid: u32,
    pub port: u16,
    pub target_url: String,
    pub uptime_secs: u64,
    /// `api_key` or `bearer`.
    pub auth_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresher: Option<RefresherStatus>,
    pub token: TokenSummary,
}

/// `GET /health`
pub async fn health(State(s): State<Arc<ProxyState>>) -> impl IntoResponse {
    let refresher = s.refresher.as_ref().map(|r| r.status());
    let degraded = refresher.as_ref().is_some_and(|r| r.degraded);
    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.to_owned(),
        pid: std::process::id(),
        port: s.port,
        target_url: s.settings.target_url.clone(),
        uptime_secs: s.started_at.elapsed().as_secs(),
        auth_mode: if s.settings.api_key.is_some() { "api_key" } else { "bearer" }.to_owned(),
        refresher,
        token: TokenSummary::from_load(&s.store.load(), Utc::now()),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub email: String,
}

/// `GET /api/token`: the current bearer value, refreshing inline when expired.
pub async fn token(State(s): State<Arc<ProxyState>>) -> Response {
    let mut tokens = match s.store.load() {
        Ok(t) => t,
        Err(e) if e.is_not_found() => {
            return ErrorCode::NoToken
                .to_http_response("no token found; run `authproxy login`")
                .into_response();
        }
        Err(e) => return ErrorCode::Internal.to_http_response(e.to_string()).into_response(),
    };

    if tokens.is_expired() {
        if let Some(refresher) = &s.refresher {
            if refresher.refresh_from(&tokens).await.is_ok() {
                if let Ok(fresh) = s.store.load() {
                    tokens = fresh;
                }
            }
        }
    }
    if tokens.is_expired() {
        let mins = -tokens.expires_in(Utc::now()).num_minutes();
        return ErrorCode::TokenExpired
            .to_http_response(format!("token expired {mins} minutes ago; run `authproxy login`"))
            .into_response();
    }

    Json(TokenResponse { token: tokens.id_token, expires_at: tokens.expires_at, email: tokens.email })
        .into_response()
}

#[derive(Debug, Serialize)]
pub struct TokenStatusResponse {
    pub token: TokenSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresher: Option<RefresherStatus>,
}

/// `GET /api/token/status`
pub async fn token_status(State(s): State<Arc<ProxyState>>) -> impl IntoResponse {
    Json(TokenStatusResponse {
        token: TokenSummary::from_load(&s.store.load(), Utc::now()),
        refresher: s.refresher.as_ref().map(|r| r.status()),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureStatus {
    Ok,
    ReauthRequired,
    ReauthInProgress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureResponse {
    pub status: EnsureStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl EnsureResponse {
    fn new(status: EnsureStatus, expires_at: Option<DateTime<Utc>>, message: Option<String>) -> Response {
        Json(Self { status, expires_at, message }).into_response()
    }
}

fn reauth_response(outcome: ReauthOutcome) -> Response {
    match outcome {
        ReauthOutcome::Started => EnsureResponse::new(
            EnsureStatus::ReauthRequired,
            None,
            Some("complete the login in your browser".to_owned()),
        ),
        ReauthOutcome::AlreadyInProgress => {
            EnsureResponse::new(EnsureStatus::ReauthInProgress, None, None)
        }
    }
}

/// `POST /api/auth/ensure`: make sure a usable token exists right now.
pub async fn ensure(State(s): State<Arc<ProxyState>>) -> Response {
    let loaded = s.store.load();
    let usable = |t: &TokenSet| !t.is_expired() && !t.is_expiring_soon(s.settings.expiry_warning);

    let Some(refresher) = &s.refresher else {
        return match &loaded {
            Ok(t) if usable(t) => EnsureResponse::new(EnsureStatus::Ok, Some(t.expires_at), None),
            _ => EnsureResponse::new(
                EnsureStatus::ReauthRequired,
                None,
                Some("no OAuth client configured; run `authproxy login`".to_owned()),
            ),
        };
    };

    let phase = refresher.status().phase;
    if phase == Phase::ReauthInProgress {
        return EnsureResponse::new(EnsureStatus::ReauthInProgress, None, None);
    }

    let current = match loaded {
        Ok(t) if usable(&t) => {
            if phase == Phase::NeedsReauth {
                refresher.clear_needs_reauth();
            }
            return EnsureResponse::new(EnsureStatus::Ok, Some(t.expires_at), None);
        }
        Ok(t) if phase != Phase::NeedsReauth => t,
        Ok(_) => return reauth_response(refresher.trigger_reauth()),
        Err(e) if e.is_not_found() => return reauth_response(refresher.trigger_reauth()),
        Err(e) => return ErrorCode::Internal.to_http_response(e.to_string()).into_response(),
    };

    match refresher.refresh_from(&current).await {
        Ok(_) => {
            let expires_at = s.store.load().map(|t| t.expires_at).ok();
            EnsureResponse::new(EnsureStatus::Ok, expires_at, None)
        }
        Err(failure) if failure.kind == FailureKind::Permanent => {
            if refresher.status().phase == Phase::ReauthInProgress {
                EnsureResponse::new(
                    EnsureStatus::ReauthRequired,
                    None,
                    Some("refresh token rejected; complete the login in your browser".to_owned()),
                )
            } else {
                EnsureResponse::new(EnsureStatus::ReauthRequired, None, Some(failure.message))
            }
        }
        Err(failure) if !current.is_expired() => EnsureResponse::new(
            EnsureStatus::Ok,
            Some(current.expires_at),
            Some(format!("refresh failed, current token still valid: {}", failure.message)),
        ),
        Err(failure) => ErrorCode::RefreshFailed
            .to_http_response(format!("token expired and refresh failed: {}", failure.message))
            .into_response(),
    }
}
