// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client-side subcommands. Each returns a process exit code.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::config::ProxyConfig;
use crate::daemon::{Coordinator, ExecSpawner, ProxyDescriptor};
use crate::error::ErrorResponse;
use crate::login::{interactive_login, SystemBrowser};
use crate::oauth::OAuthClient;
use crate::proxy::api::{EnsureResponse, EnsureStatus, HealthResponse, TokenResponse, TokenSummary};
use crate::refresher::{Phase, RefresherStatus};
use crate::store::TokenStore;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
/// Configuration is missing or invalid.
pub const EXIT_USAGE: i32 = 2;
/// The user has to finish a browser login.
pub const EXIT_REAUTH: i32 = 3;

/// Local requests to the daemon can wait on an inline refresh.
const DAEMON_REQUEST_TIMEOUT: Duration = Duration::from_secs(45);

fn coordinator(config: &ProxyConfig, target_url: &str) -> Result<Coordinator, String> {
    let spawner = Arc::new(ExecSpawner::new(config.to_env()));
    Coordinator::new(config.daemon_paths(), target_url, spawner).map_err(|e| e.to_string())
}

fn http_client() -> Result<reqwest::Client, String> {
    crate::ensure_crypto();
    reqwest::Client::builder()
        .no_proxy()
        .timeout(DAEMON_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| format!("cannot build http client: {e}"))
}

/// Start (or reuse) the daemon for the configured target.
async fn running_daemon(config: &ProxyConfig) -> Result<ProxyDescriptor, (i32, String)> {
    let target = config.require_target().map_err(|e| (EXIT_USAGE, e.to_string()))?;
    let coord = coordinator(config, &target).map_err(|e| (EXIT_FAILURE, e))?;
    coord.ensure_running().await.map_err(|e| (EXIT_FAILURE, e.to_string()))
}

/// Decode a daemon response, turning error envelopes into their message.
async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, String> {
    let status = resp.status();
    if status.is_success() {
        return resp.json::<T>().await.map_err(|e| format!("invalid response: {e}"));
    }
    let text = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&text) {
        Ok(err) => Err(err.error.message),
        Err(_) => Err(format!("daemon returned {status}")),
    }
}

pub async fn fetch_health(http: &reqwest::Client, base_url: &str) -> Result<HealthResponse, String> {
    let resp = http
        .get(format!("{base_url}/health"))
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;
    decode(resp).await
}

pub async fn fetch_token(http: &reqwest::Client, base_url: &str) -> Result<TokenResponse, String> {
    let resp = http
        .get(format!("{base_url}/api/token"))
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;
    decode(resp).await
}

pub async fn post_ensure(http: &reqwest::Client, base_url: &str) -> Result<EnsureResponse, String> {
    let resp = http
        .post(format!("{base_url}/api/auth/ensure"))
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;
    decode(resp).await
}

/// Human description of a token, with the next step when it is unusable.
pub fn token_message(token: &TokenSummary, now: DateTime<Utc>) -> String {
    if let Some(err) = &token.error {
        return format!("token file unreadable ({err}); run `authproxy login`");
    }
    let Some(expires_at) = token.expires_at.filter(|_| token.present) else {
        return "no token; run `authproxy login`".to_owned();
    };
    let who = token.email.as_deref().map(|e| format!(" for {e}")).unwrap_or_default();
    let mins = (expires_at - now).num_minutes();
    if token.valid {
        format!("valid{who}, expires in {} minutes", mins.max(0))
    } else {
        format!("token expired {} minutes ago; run `authproxy login`", (-mins).max(0))
    }
}

fn refresher_line(status: &RefresherStatus) -> String {
    let mut line = match status.phase {
        Phase::Idle => "idle".to_owned(),
        Phase::NeedsReauth => "needs re-authentication (run `authproxy ensure` or `authproxy login`)".to_owned(),
        Phase::ReauthInProgress => "re-authentication in progress, finish the login in your browser".to_owned(),
    };
    if status.degraded {
        line.push_str(", DEGRADED: background refresh stopped, restart with `authproxy stop && authproxy start`");
    }
    if status.retry_count > 0 {
        line.push_str(&format!(", {} failed attempts", status.retry_count));
        if let Some(secs) = status.retry_in_secs {
            line.push_str(&format!(", next retry in {secs}s"));
        }
    }
    if let Some(warning) = &status.warning {
        line.push_str(&format!("\n  warning: {warning}"));
    }
    line
}

/// Exit code for an ensure outcome.
pub fn ensure_exit_code(resp: &EnsureResponse) -> i32 {
    match resp.status {
        EnsureStatus::Ok => EXIT_OK,
        EnsureStatus::ReauthRequired | EnsureStatus::ReauthInProgress => EXIT_REAUTH,
    }
}

/// `authproxy start`
pub async fn start(config: &ProxyConfig) -> i32 {
    match running_daemon(config).await {
        Ok(desc) => {
            println!("authproxy running on {} (pid {}) -> {}", desc.base_url(), desc.pid, desc.target_url);
            EXIT_OK
        }
        Err((code, e)) => {
            eprintln!("error: {e}");
            code
        }
    }
}

/// `authproxy stop`
pub async fn stop(config: &ProxyConfig) -> i32 {
    let target = config.target_url.clone().unwrap_or_default();
    let coord = match coordinator(config, &target) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_FAILURE;
        }
    };
    match coord.stop().await {
        Ok(Some(desc)) => {
            println!("stopped authproxy (pid {})", desc.pid);
            EXIT_OK
        }
        Ok(None) => {
            println!("authproxy is not running");
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_FAILURE
        }
    }
}

/// `authproxy status`
pub async fn status(config: &ProxyConfig) -> i32 {
    let now = Utc::now();
    let target = config.target_url.clone().unwrap_or_default();
    let running = match coordinator(config, &target) {
        Ok(coord) => coord.running().await,
        Err(_) => None,
    };

    let health = match &running {
        Some(desc) => match match http_client() {
            Ok(http) => fetch_health(&http, &desc.base_url()).await,
            Err(e) => Err(e),
        } {
            Ok(h) => Some(h),
            Err(e) => {
                eprintln!("warning: daemon did not report health: {e}");
                None
            }
        },
        None => None,
    };

    let token = match &health {
        Some(h) => {
            println!("daemon:    {} on port {} (pid {}, up {}s)", h.status, h.port, h.pid, h.uptime_secs);
            println!("target:    {}", h.target_url);
            println!("auth mode: {}", h.auth_mode);
            if let Some(r) = &h.refresher {
                println!("refresher: {}", refresher_line(r));
            }
            h.token.clone()
        }
        None => {
            println!("daemon:    not running (run `authproxy start`)");
            TokenSummary::from_load(&TokenStore::new(config.token_path()).load(), now)
        }
    };
    println!("token:     {}", token_message(&token, now));

    if token.valid || config.api_key().is_some() {
        EXIT_OK
    } else {
        EXIT_FAILURE
    }
}

/// `authproxy login`
pub async fn login(config: &ProxyConfig) -> i32 {
    let oauth = match config.require_oauth() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_USAGE;
        }
    };
    let client = match OAuthClient::new(oauth) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e:#}");
            return EXIT_FAILURE;
        }
    };
    let tokens = match interactive_login(&client, &SystemBrowser, config.reauth_timeout()).await {
        Ok(t) => t,
        Err(e) => {
            eprintln!("login failed: {e}");
            return EXIT_FAILURE;
        }
    };
    let store = TokenStore::new(config.token_path());
    if let Err(e) = store.save(&tokens) {
        eprintln!("error: could not save tokens to {}: {e}", store.path().display());
        return EXIT_FAILURE;
    }
    println!("logged in as {}; token expires at {}", tokens.email, tokens.expires_at);
    EXIT_OK
}

/// `authproxy logout`
pub fn logout(config: &ProxyConfig) -> i32 {
    let store = TokenStore::new(config.token_path());
    match store.delete() {
        Ok(true) => {
            println!("removed stored tokens ({})", store.path().display());
            EXIT_OK
        }
        Ok(false) => {
            println!("no stored tokens");
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_FAILURE
        }
    }
}

/// `authproxy token`
pub async fn token(config: &ProxyConfig) -> i32 {
    let desc = match running_daemon(config).await {
        Ok(d) => d,
        Err((code, e)) => {
            eprintln!("error: {e}");
            return code;
        }
    };
    let http = match http_client() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_FAILURE;
        }
    };
    match fetch_token(&http, &desc.base_url()).await {
        Ok(t) => {
            println!("{}", t.token);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_FAILURE
        }
    }
}

/// `authproxy ensure`
pub async fn ensure(config: &ProxyConfig) -> i32 {
    let desc = match running_daemon(config).await {
        Ok(d) => d,
        Err((code, e)) => {
            eprintln!("error: {e}");
            return code;
        }
    };
    let http = match http_client() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_FAILURE;
        }
    };
    match post_ensure(&http, &desc.base_url()).await {
        Ok(resp) => {
            match (resp.status, &resp.expires_at) {
                (EnsureStatus::Ok, Some(at)) => println!("token valid until {at}"),
                (EnsureStatus::Ok, None) => println!("token valid"),
                (EnsureStatus::ReauthRequired, _) => println!("re-authentication required"),
                (EnsureStatus::ReauthInProgress, _) => {
                    println!("re-authentication in progress, finish the login in your browser")
                }
            }
            if let Some(message) = &resp.message {
                println!("  {message}");
            }
            ensure_exit_code(&resp)
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_FAILURE
        }
    }
}

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;
