// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local reverse proxy: injects credentials into every request and
//! forwards it to the configured upstream.

pub mod api;
pub mod forward;
pub mod inject;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderName;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::refresher::Refresher;
use crate::store::TokenStore;

/// Near-expiry window that triggers a warning on each proxied request.
pub const EXPIRY_WARNING_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Per-daemon proxy settings.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Upstream base URL without a trailing slash.
    pub target_url: String,
    pub api_key: Option<String>,
    pub api_key_header: HeaderName,
    pub expiry_warning: Duration,
}

impl ProxySettings {
    pub fn new(target_url: &str, api_key: Option<String>, api_key_header: &str) -> anyhow::Result<Self> {
        let api_key_header = HeaderName::try_from(api_key_header)
            .map_err(|e| anyhow::anyhow!("invalid API key header {api_key_header:?}: {e}"))?;
        Ok(Self {
            target_url: target_url.trim_end_matches('/').to_owned(),
            api_key,
            api_key_header,
            expiry_warning: EXPIRY_WARNING_WINDOW,
        })
    }
}

/// Shared state for the proxy handlers.
pub struct ProxyState {
    pub settings: ProxySettings,
    pub store: TokenStore,
    /// Absent when no OAuth client is configured.
    pub refresher: Option<Arc<Refresher>>,
    pub http: reqwest::Client,
    pub started_at: Instant,
    pub port: u16,
}

impl ProxyState {
    pub fn new(
        settings: ProxySettings,
        store: TokenStore,
        refresher: Option<Arc<Refresher>>,
        port: u16,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            settings,
            store,
            refresher,
            http: forward::build_client()?,
            started_at: Instant::now(),
            port,
        })
    }
}

/// Build the proxy router: local side-channel routes plus the forwarding fallback.
pub fn build_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/token", get(api::token))
        .route("/api/token/status", get(api::token_status))
        .route("/api/auth/ensure", post(api::ensure))
        .fallback(forward::proxy_request)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
