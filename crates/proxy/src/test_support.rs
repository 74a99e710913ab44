// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: fake tokens, a mock token endpoint, and
//! scripted browser openers.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Form;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use url::Url;

use crate::login::BrowserOpener;
use crate::oauth::OAuthConfig;
use crate::store::TokenSet;

/// Unsigned JWT carrying only the given claims.
pub fn fake_jwt(email: Option<&str>, exp: Option<i64>) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let mut claims = serde_json::Map::new();
    claims.insert("sub".to_owned(), "user-1".into());
    if let Some(email) = email {
        claims.insert("email".to_owned(), email.into());
    }
    if let Some(exp) = exp {
        claims.insert("exp".to_owned(), exp.into());
    }
    let payload = URL_SAFE_NO_PAD.encode(serde_json::Value::Object(claims).to_string());
    format!("{header}.{payload}.sig")
}

/// A token set tagged `tag` that expires `expires_in` from now, at whole-second
/// precision so `expires_at` matches the ID token's `exp`.
pub fn sample_tokens(tag: &str, expires_in: TimeDelta) -> TokenSet {
    let exp = (Utc::now() + expires_in).timestamp();
    TokenSet {
        id_token: fake_jwt(Some("dev@example.com"), Some(exp)),
        access_token: format!("access-{tag}"),
        refresh_token: format!("refresh-{tag}"),
        expires_at: DateTime::from_timestamp(exp, 0).unwrap_or_else(Utc::now),
        email: "dev@example.com".to_owned(),
    }
}

/// JSON body of a successful token response whose ID token expires
/// `expires_in` from now.
pub fn token_body(tag: &str, expires_in: TimeDelta) -> String {
    let exp = (Utc::now() + expires_in).timestamp();
    serde_json::json!({
        "id_token": fake_jwt(Some("dev@example.com"), Some(exp)),
        "access_token": format!("access-{tag}"),
        "refresh_token": format!("refresh-{tag}"),
        "expires_in": expires_in.num_seconds(),
        "token_type": "Bearer",
    })
    .to_string()
}

/// Loopback OAuth provider replaying scripted token responses.
pub struct MockTokenServer {
    pub addr: SocketAddr,
    calls: Arc<AtomicU32>,
    forms: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

impl MockTokenServer {
    pub async fn start(responses: Vec<(u16, String)>) -> anyhow::Result<Self> {
        Self::start_with_delay(responses, Duration::ZERO).await
    }

    /// Like [`start`](Self::start), but every token response is delayed.
    pub async fn start_with_delay(
        responses: Vec<(u16, String)>,
        delay: Duration,
    ) -> anyhow::Result<Self> {
        let calls = Arc::new(AtomicU32::new(0));
        let forms = Arc::new(Mutex::new(Vec::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let responses = Arc::new(responses);
        let token = {
            let calls = Arc::clone(&calls);
            let forms = Arc::clone(&forms);
            post(move |Form(form): Form<HashMap<String, String>>| {
                let calls = Arc::clone(&calls);
                let forms = Arc::clone(&forms);
                let responses = Arc::clone(&responses);
                async move {
                    let idx = calls.fetch_add(1, Ordering::SeqCst) as usize;
                    forms.lock().push(form);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    // Past the script, repeat the last response.
                    let (status, body) = responses
                        .get(idx)
                        .or_else(|| responses.last())
                        .cloned()
                        .unwrap_or((500, "{}".to_owned()));
                    (StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR), body)
                }
            })
        };
        let discovery = get(move || async move {
            Json(serde_json::json!({
                "issuer": format!("http://{addr}"),
                "authorization_endpoint": format!("http://{addr}/authorize"),
                "token_endpoint": format!("http://{addr}/token"),
            }))
        });

        let app = Router::new()
            .route("/token", token)
            .route("/.well-known/openid-configuration", discovery);
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Ok(Self { addr, calls, forms })
    }

    pub fn issuer(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn token_url(&self) -> String {
        format!("http://{}/token", self.addr)
    }

    pub fn authorize_url(&self) -> String {
        format!("http://{}/authorize", self.addr)
    }

    /// Number of token endpoint requests received.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Form bodies of every token request, in arrival order.
    pub fn forms(&self) -> Vec<HashMap<String, String>> {
        self.forms.lock().clone()
    }

    /// Client config with explicit endpoints and an ephemeral callback port.
    pub fn oauth_config(&self) -> OAuthConfig {
        OAuthConfig {
            client_id: "test-client".to_owned(),
            issuer: None,
            authorize_endpoint: Some(self.authorize_url()),
            token_endpoint: Some(self.token_url()),
            callback_port: 0,
        }
    }
}

/// Start a [`MockTokenServer`] replaying `responses`.
pub async fn mock_token_server(responses: Vec<(u16, String)>) -> anyhow::Result<MockTokenServer> {
    MockTokenServer::start(responses).await
}

#[derive(Debug, Clone)]
enum OpenerMode {
    Approve { code: String, state: Option<String> },
    Deny(String),
    Ignore,
}

/// Browser stand-in that drives the loopback callback the way a real
/// authorization server redirect would.
#[derive(Debug, Clone)]
pub struct CallbackOpener {
    mode: OpenerMode,
    opened: Arc<Mutex<Vec<String>>>,
}

impl CallbackOpener {
    /// Approve the login, echoing the requested state.
    pub fn approve(code: &str) -> Self {
        Self::with_mode(OpenerMode::Approve { code: code.to_owned(), state: None })
    }

    /// Approve the login but return `state` instead of the requested one.
    pub fn approve_with_state(code: &str, state: &str) -> Self {
        Self::with_mode(OpenerMode::Approve {
            code: code.to_owned(),
            state: Some(state.to_owned()),
        })
    }

    /// Redirect back with `error=<error>`.
    pub fn deny(error: &str) -> Self {
        Self::with_mode(OpenerMode::Deny(error.to_owned()))
    }

    /// Record the URL and never call back.
    pub fn ignore() -> Self {
        Self::with_mode(OpenerMode::Ignore)
    }

    fn with_mode(mode: OpenerMode) -> Self {
        Self { mode, opened: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Authorization URLs opened so far.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

impl BrowserOpener for CallbackOpener {
    fn open(&self, url: &str) -> io::Result<()> {
        self.opened.lock().push(url.to_owned());

        let invalid = |e: url::ParseError| io::Error::new(io::ErrorKind::InvalidInput, e);
        let auth = Url::parse(url).map_err(invalid)?;
        let query: HashMap<String, String> = auth.query_pairs().into_owned().collect();
        let redirect = query
            .get("redirect_uri")
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no redirect_uri"))?;
        let mut target = Url::parse(redirect).map_err(invalid)?;
        target.set_host(Some("127.0.0.1")).map_err(invalid)?;

        match &self.mode {
            OpenerMode::Ignore => return Ok(()),
            OpenerMode::Deny(error) => {
                target.query_pairs_mut().append_pair("error", error);
            }
            OpenerMode::Approve { code, state } => {
                let state = state.clone().or_else(|| query.get("state").cloned()).unwrap_or_default();
                target.query_pairs_mut().append_pair("code", code).append_pair("state", &state);
            }
        }

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        crate::ensure_crypto();
        handle.spawn(async move {
            if let Err(e) = reqwest::get(target).await {
                tracing::warn!(err = %e, "scripted callback request failed");
            }
        });
        Ok(())
    }
}

/// Serve `app` on an ephemeral loopback port for the rest of the test.
pub async fn serve_on_loopback(app: Router) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    Ok(addr)
}
