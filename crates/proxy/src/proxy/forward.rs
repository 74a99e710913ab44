// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Streaming request forwarding to the upstream API.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{self, HeaderName};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use crate::error::ErrorCode;
use crate::proxy::{inject, ProxyState};

/// TCP connect plus TLS handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Time allowed for the upstream to start responding.
pub const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);
pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
pub const POOL_MAX_IDLE_PER_HOST: usize = 32;

/// Connection-level headers that must not be forwarded (RFC 9110 §7.6.1).
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// HTTP client shared by all forwarded requests.
pub fn build_client() -> anyhow::Result<reqwest::Client> {
    crate::ensure_crypto();
    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    Ok(client)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// Fallback handler: forward anything that is not a local route.
pub async fn proxy_request(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let url = format!("{}{}", state.settings.target_url, path_and_query);

    let credential = inject::resolve_credential(&state, parts.uri.path()).await;
    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    inject::apply(&mut headers, &state.settings.api_key_header, &credential);

    let request = state
        .http
        .request(parts.method.clone(), &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    let upstream = match tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, request.send()).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            tracing::warn!(method = %parts.method, %url, err = %e, "upstream request failed");
            return ErrorCode::UpstreamError
                .to_http_response(format!("upstream request failed: {e}"))
                .into_response();
        }
        Err(_) => {
            tracing::warn!(method = %parts.method, %url, "upstream response timed out");
            return ErrorCode::UpstreamError
                .to_http_response(format!(
                    "upstream did not respond within {}s",
                    RESPONSE_HEADER_TIMEOUT.as_secs()
                ))
                .into_response();
        }
    };

    let status = upstream.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        tracing::warn!(%url, "upstream rejected credentials");
    }
    let mut resp_headers = upstream.headers().clone();
    strip_hop_by_hop(&mut resp_headers);

    let mut response = Body::from_stream(upstream.bytes_stream()).into_response();
    *response.status_mut() = status;
    *response.headers_mut() = resp_headers;
    response
}
