// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that drive the real `authproxy` binary and the
//! daemon it spawns.

use std::time::Duration;

use axum::http::HeaderMap;
use axum::{Json, Router};

use authproxy::test_support::serve_on_loopback;
use authproxy_specs::{ensure_crypto, Sandbox};

/// Upstream that echoes the credential headers it received.
async fn echo_upstream() -> anyhow::Result<String> {
    async fn echo(headers: HeaderMap) -> Json<serde_json::Value> {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_owned);
        Json(serde_json::json!({
            "authorization": header("authorization"),
            "x_api_key": header("x-api-key"),
        }))
    }
    let addr = serve_on_loopback(Router::new().fallback(echo)).await?;
    Ok(format!("http://{addr}"))
}

async fn health_pid(base_url: &str) -> Option<u64> {
    ensure_crypto();
    let client = reqwest::Client::builder().timeout(Duration::from_secs(2)).build().ok()?;
    let body: serde_json::Value = client.get(format!("{base_url}/health")).send().await.ok()?.json().await.ok()?;
    body["pid"].as_u64()
}

#[tokio::test]
async fn start_twice_reuses_one_daemon() -> anyhow::Result<()> {
    let Some(sandbox) = Sandbox::new()? else { return Ok(()) };

    let first = sandbox.start("http://127.0.0.1:9", &[]).await?;
    let second = sandbox.start("http://127.0.0.1:9/", &[]).await?;
    assert_eq!(first.pid, second.pid);
    assert_eq!(first.port, second.port);
    assert_eq!(health_pid(&first.base_url()).await, Some(u64::from(first.pid)));

    let out = sandbox.run(&["stop"]).await?;
    assert!(out.status.success());
    assert!(sandbox.descriptor().is_none());
    assert_eq!(health_pid(&first.base_url()).await, None);
    Ok(())
}

#[tokio::test]
async fn changing_target_restarts_the_daemon() -> anyhow::Result<()> {
    let Some(sandbox) = Sandbox::new()? else { return Ok(()) };

    let first = sandbox.start("http://127.0.0.1:9", &[]).await?;
    let second = sandbox.start("http://127.0.0.1:10", &[]).await?;
    assert_ne!(first.pid, second.pid);
    assert_eq!(second.target_url, "http://127.0.0.1:10");
    assert_eq!(health_pid(&first.base_url()).await, None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn daemon_injects_static_api_key() -> anyhow::Result<()> {
    let Some(sandbox) = Sandbox::new()? else { return Ok(()) };
    let upstream = echo_upstream().await?;
    ensure_crypto();

    let desc = sandbox.start(&upstream, &["--api-key", "sk-e2e"]).await?;
    let body: serde_json::Value =
        reqwest::get(format!("{}/v1/models", desc.base_url())).await?.json().await?;
    assert_eq!(body["x_api_key"], "sk-e2e");
    assert!(body["authorization"].is_null());
    Ok(())
}

#[tokio::test]
async fn token_without_login_is_actionable() -> anyhow::Result<()> {
    let Some(sandbox) = Sandbox::new()? else { return Ok(()) };

    let out = sandbox.run(&["token", "--target-url", "http://127.0.0.1:9"]).await?;
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("authproxy login"), "stderr: {stderr}");
    Ok(())
}

#[tokio::test]
async fn status_without_daemon_suggests_start() -> anyhow::Result<()> {
    let Some(sandbox) = Sandbox::new()? else { return Ok(()) };

    let out = sandbox.run(&["status"]).await?;
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("not running"), "stdout: {stdout}");
    assert!(stdout.contains("no token"), "stdout: {stdout}");
    Ok(())
}
