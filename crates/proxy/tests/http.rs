// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Integration tests for the proxy HTTP surface.
//!
//! Local routes run through `axum_test::TestServer`; forwarding targets a
//! real loopback echo server.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::{Json, Router};
use axum_test::TestServer;
use chrono::TimeDelta;

use authproxy::oauth::OAuthClient;
use authproxy::proxy::api::{EnsureResponse, EnsureStatus, TokenResponse};
use authproxy::proxy::{build_router, ProxySettings, ProxyState};
use authproxy::refresher::{Refresher, RefresherConfig};
use authproxy::store::TokenStore;
use authproxy::test_support::{
    mock_token_server, sample_tokens, serve_on_loopback, token_body, CallbackOpener, MockTokenServer,
};

struct Harness {
    server: TestServer,
    store: TokenStore,
    refresher: Option<Arc<Refresher>>,
    _dir: tempfile::TempDir,
}

fn store_in(dir: &Path) -> TokenStore {
    TokenStore::new(dir.join("tokens.json"))
}

fn harness(target: &str, api_key: Option<&str>, oauth: Option<&MockTokenServer>) -> anyhow::Result<Harness> {
    let dir = tempfile::tempdir()?;
    let store = store_in(dir.path());
    let refresher = match oauth {
        Some(mock) => {
            let client = Arc::new(OAuthClient::new(mock.oauth_config())?);
            let config = RefresherConfig {
                reauth_timeout: Duration::from_millis(200),
                ..RefresherConfig::default()
            };
            Some(Refresher::new(store.clone(), client, Arc::new(CallbackOpener::ignore()), config))
        }
        None => None,
    };
    let settings = ProxySettings::new(target, api_key.map(str::to_owned), "x-api-key")?;
    let state = Arc::new(ProxyState::new(settings, store.clone(), refresher.clone(), 0)?);
    let server = TestServer::new(build_router(state))?;
    Ok(Harness { server, store, refresher, _dir: dir })
}

/// Upstream that reports what it received.
async fn echo_upstream() -> anyhow::Result<String> {
    async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Json<serde_json::Value> {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_owned);
        Json(serde_json::json!({
            "method": method.as_str(),
            "path": uri.path(),
            "query": uri.query(),
            "authorization": header("authorization"),
            "x_api_key": header("x-api-key"),
            "body": String::from_utf8_lossy(&body),
        }))
    }
    let addr = serve_on_loopback(Router::new().fallback(echo)).await?;
    Ok(format!("http://{addr}"))
}

fn authorization(value: &'static str) -> (HeaderName, HeaderValue) {
    (HeaderName::from_static("authorization"), HeaderValue::from_static(value))
}

// -- Local routes --------------------------------------------------------

#[tokio::test]
async fn health_reports_mode_and_token() -> anyhow::Result<()> {
    let h = harness("http://127.0.0.1:9", None, None)?;
    h.store.save(&sample_tokens("h", TimeDelta::hours(1)))?;

    let resp = h.server.get("/health").await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["pid"], std::process::id());
    assert_eq!(body["auth_mode"], "bearer");
    assert_eq!(body["target_url"], "http://127.0.0.1:9");
    assert_eq!(body["token"]["present"], true);
    assert_eq!(body["token"]["valid"], true);
    assert_eq!(body["token"]["email"], "dev@example.com");
    assert!(body.get("refresher").is_none());
    Ok(())
}

#[tokio::test]
async fn health_in_api_key_mode() -> anyhow::Result<()> {
    let h = harness("http://127.0.0.1:9", Some("sk-static"), None)?;
    let body: serde_json::Value = h.server.get("/health").await.json();
    assert_eq!(body["auth_mode"], "api_key");
    assert_eq!(body["token"]["present"], false);
    assert!(!body.to_string().contains("sk-static"));
    Ok(())
}

#[tokio::test]
async fn token_without_file_is_no_token() -> anyhow::Result<()> {
    let h = harness("http://127.0.0.1:9", None, None)?;
    let resp = h.server.get("/api/token").await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "NO_TOKEN");
    Ok(())
}

#[tokio::test]
async fn expired_token_without_refresher_is_token_expired() -> anyhow::Result<()> {
    let h = harness("http://127.0.0.1:9", None, None)?;
    h.store.save(&sample_tokens("old", -TimeDelta::minutes(12)))?;

    let resp = h.server.get("/api/token").await;
    resp.assert_status(StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "TOKEN_EXPIRED");
    let message = body["error"]["message"].as_str().unwrap_or_default();
    assert!(message.contains("minutes ago"), "{message}");
    assert!(message.contains("authproxy login"), "{message}");
    Ok(())
}

#[tokio::test]
async fn token_returns_id_token() -> anyhow::Result<()> {
    let h = harness("http://127.0.0.1:9", None, None)?;
    let tokens = sample_tokens("t", TimeDelta::hours(1));
    h.store.save(&tokens)?;

    let resp = h.server.get("/api/token").await;
    resp.assert_status_ok();
    let body: TokenResponse = resp.json();
    assert_eq!(body.token, tokens.id_token);
    assert_eq!(body.expires_at, tokens.expires_at);
    Ok(())
}

#[tokio::test]
async fn expired_token_is_refreshed_inline() -> anyhow::Result<()> {
    let mock = mock_token_server(vec![(200, token_body("new", TimeDelta::hours(1)))]).await?;
    let h = harness("http://127.0.0.1:9", None, Some(&mock))?;
    h.store.save(&sample_tokens("old", -TimeDelta::minutes(1)))?;

    let resp = h.server.get("/api/token").await;
    resp.assert_status_ok();
    assert_eq!(mock.calls(), 1);
    assert_eq!(h.store.load()?.access_token, "access-new");
    Ok(())
}

#[tokio::test]
async fn token_status_includes_refresher() -> anyhow::Result<()> {
    let mock = mock_token_server(vec![]).await?;
    let h = harness("http://127.0.0.1:9", None, Some(&mock))?;
    h.store.save(&sample_tokens("s", TimeDelta::hours(1)))?;

    let body: serde_json::Value = h.server.get("/api/token/status").await.json();
    assert_eq!(body["token"]["valid"], true);
    assert_eq!(body["refresher"]["phase"], "idle");
    assert_eq!(body["refresher"]["retry_count"], 0);
    Ok(())
}

#[tokio::test]
async fn ensure_with_fresh_token_is_ok() -> anyhow::Result<()> {
    let mock = mock_token_server(vec![]).await?;
    let h = harness("http://127.0.0.1:9", None, Some(&mock))?;
    let tokens = sample_tokens("fresh", TimeDelta::hours(1));
    h.store.save(&tokens)?;

    let body: EnsureResponse = h.server.post("/api/auth/ensure").await.json();
    assert_eq!(body.status, EnsureStatus::Ok);
    assert_eq!(body.expires_at, Some(tokens.expires_at));
    assert_eq!(mock.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn ensure_refreshes_expired_token() -> anyhow::Result<()> {
    let mock = mock_token_server(vec![(200, token_body("new", TimeDelta::hours(1)))]).await?;
    let h = harness("http://127.0.0.1:9", None, Some(&mock))?;
    h.store.save(&sample_tokens("old", -TimeDelta::minutes(3)))?;

    let body: EnsureResponse = h.server.post("/api/auth/ensure").await.json();
    assert_eq!(body.status, EnsureStatus::Ok);
    assert_eq!(mock.calls(), 1);
    assert_eq!(h.store.load()?.access_token, "access-new");
    Ok(())
}

#[tokio::test]
async fn ensure_with_revoked_refresh_token_requires_reauth() -> anyhow::Result<()> {
    let mock = mock_token_server(vec![(400, r#"{"error":"invalid_grant"}"#.to_owned())]).await?;
    let h = harness("http://127.0.0.1:9", None, Some(&mock))?;
    h.store.save(&sample_tokens("old", TimeDelta::minutes(2)))?;

    let body: EnsureResponse = h.server.post("/api/auth/ensure").await.json();
    assert_eq!(body.status, EnsureStatus::ReauthRequired);

    if let Some(r) = &h.refresher {
        r.stop().await;
    }
    Ok(())
}

#[tokio::test]
async fn ensure_with_expired_token_and_transient_failure_is_503() -> anyhow::Result<()> {
    let mock = mock_token_server(vec![(502, "bad gateway".to_owned())]).await?;
    let h = harness("http://127.0.0.1:9", None, Some(&mock))?;
    h.store.save(&sample_tokens("old", -TimeDelta::minutes(3)))?;

    let resp = h.server.post("/api/auth/ensure").await;
    resp.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "REFRESH_FAILED");
    Ok(())
}

#[tokio::test]
async fn ensure_with_valid_token_and_transient_failure_is_ok() -> anyhow::Result<()> {
    let mock = mock_token_server(vec![(502, "bad gateway".to_owned())]).await?;
    let h = harness("http://127.0.0.1:9", None, Some(&mock))?;
    h.store.save(&sample_tokens("old", TimeDelta::minutes(2)))?;

    let body: EnsureResponse = h.server.post("/api/auth/ensure").await.json();
    assert_eq!(body.status, EnsureStatus::Ok);
    assert!(body.message.unwrap_or_default().contains("refresh failed"));
    Ok(())
}

// -- Forwarding ----------------------------------------------------------

#[tokio::test]
async fn forward_replaces_client_authorization_with_bearer() -> anyhow::Result<()> {
    let upstream = echo_upstream().await?;
    let h = harness(&upstream, None, None)?;
    let tokens = sample_tokens("fwd", TimeDelta::hours(1));
    h.store.save(&tokens)?;

    let (name, value) = authorization("Bearer client-supplied");
    let resp = h.server.get("/v1/models").add_query_param("limit", "5").add_header(name, value).await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["method"], "GET");
    assert_eq!(body["path"], "/v1/models");
    assert_eq!(body["query"], "limit=5");
    assert_eq!(body["authorization"], format!("Bearer {}", tokens.id_token));
    assert!(body["x_api_key"].is_null());
    Ok(())
}

#[tokio::test]
async fn forward_streams_request_body() -> anyhow::Result<()> {
    let upstream = echo_upstream().await?;
    let h = harness(&upstream, None, None)?;
    h.store.save(&sample_tokens("b", TimeDelta::hours(1)))?;

    let resp = h.server.post("/v1/messages").text("hello upstream").await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["method"], "POST");
    assert_eq!(body["body"], "hello upstream");
    Ok(())
}

#[tokio::test]
async fn api_key_mode_uses_static_key() -> anyhow::Result<()> {
    let upstream = echo_upstream().await?;
    let h = harness(&upstream, Some("sk-static"), None)?;
    h.store.save(&sample_tokens("k", TimeDelta::hours(1)))?;

    let body: serde_json::Value = h.server.get("/v1/models").await.json();
    assert_eq!(body["x_api_key"], "sk-static");
    assert!(body["authorization"].is_null());
    Ok(())
}

#[tokio::test]
async fn management_paths_use_bearer_even_with_api_key() -> anyhow::Result<()> {
    let upstream = echo_upstream().await?;
    let h = harness(&upstream, Some("sk-static"), None)?;
    let tokens = sample_tokens("m", TimeDelta::hours(1));
    h.store.save(&tokens)?;

    let body: serde_json::Value = h.server.post("/v1/keys").await.json();
    assert_eq!(body["authorization"], format!("Bearer {}", tokens.id_token));
    assert!(body["x_api_key"].is_null());
    Ok(())
}

#[tokio::test]
async fn expired_token_is_still_forwarded() -> anyhow::Result<()> {
    let upstream = echo_upstream().await?;
    let h = harness(&upstream, None, None)?;
    let tokens = sample_tokens("stale", -TimeDelta::minutes(5));
    h.store.save(&tokens)?;

    let body: serde_json::Value = h.server.get("/v1/models").await.json();
    assert_eq!(body["authorization"], format!("Bearer {}", tokens.id_token));
    Ok(())
}

#[tokio::test]
async fn missing_token_forwards_unauthenticated() -> anyhow::Result<()> {
    let upstream = echo_upstream().await?;
    let h = harness(&upstream, None, None)?;

    let (name, value) = authorization("Bearer client-supplied");
    let body: serde_json::Value = h.server.get("/v1/models").add_header(name, value).await.json();
    assert!(body["authorization"].is_null());
    Ok(())
}

#[tokio::test]
async fn unreachable_upstream_is_502() -> anyhow::Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let dead = format!("http://{}", listener.local_addr()?);
    drop(listener);
    let h = harness(&dead, Some("sk"), None)?;

    let resp = h.server.get("/v1/models").await;
    resp.assert_status(StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"]["code"], "UPSTREAM_ERROR");
    Ok(())
}
