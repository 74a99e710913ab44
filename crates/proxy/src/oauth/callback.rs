// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Loopback listener that captures one OAuth redirect.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;

/// Per-request timeout on the callback server.
pub const CALLBACK_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Successful redirect parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("authorization denied: {error}{}", .description.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    Denied { error: String, description: Option<String> },
    #[error("no authorization code received")]
    MissingCode,
    #[error("timed out waiting for the browser callback")]
    Timeout,
    #[error("callback listener closed before a redirect arrived")]
    Closed,
    #[error("cannot listen on 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

type CallbackResult = Result<CallbackParams, CallbackError>;

/// A running callback listener for a single login attempt.
pub struct CallbackServer {
    addr: SocketAddr,
    rx: mpsc::Receiver<CallbackResult>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl CallbackServer {
    /// Bind `127.0.0.1:port` and start serving `/callback`. Port 0 picks
    /// an ephemeral port.
    pub async fn bind(port: u16) -> Result<Self, CallbackError> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|source| CallbackError::Bind { port, source })?;
        let addr = listener.local_addr().map_err(|source| CallbackError::Bind { port, source })?;

        // One slot: only the first redirect is delivered.
        let (tx, rx) = mpsc::channel(1);
        let app = Router::new()
            .route("/callback", get(handle_callback))
            .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, CALLBACK_IO_TIMEOUT))
            .with_state(tx);

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) =
                axum::serve(listener, app).with_graceful_shutdown(shutdown.cancelled_owned()).await
            {
                tracing::warn!(err = %e, "callback listener failed");
            }
        });
        tracing::debug!(%addr, "callback listener started");
        Ok(Self { addr, rx, cancel, handle })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Redirect URI registered in the authorization request. Names the
    /// bound loopback address so the browser cannot resolve it to `::1`.
    pub fn redirect_uri(&self) -> String {
        format!("http://{}/callback", self.addr)
    }

    /// Wait for the first redirect, or fail after `timeout`.
    pub async fn wait_for_callback(&mut self, timeout: Duration) -> CallbackResult {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(result)) => result,
            Ok(None) => Err(CallbackError::Closed),
            Err(_) => Err(CallbackError::Timeout),
        }
    }

    /// Stop accepting connections and wait for the server task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.handle).await {
            tracing::debug!(err = %e, "callback listener task ended abnormally");
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn handle_callback(
    State(tx): State<mpsc::Sender<CallbackResult>>,
    Query(params): Query<HashMap<String, String>>,
) -> Html<String> {
    let result = parse_redirect(&params);
    let page = match &result {
        Ok(_) => render_page(
            "Login complete",
            "Authentication succeeded. You can close this tab and return to the terminal.",
        ),
        Err(e) => render_page("Login failed", &e.to_string()),
    };
    if tx.try_send(result).is_err() {
        tracing::debug!("ignoring duplicate oauth callback");
    }
    Html(page)
}

fn parse_redirect(params: &HashMap<String, String>) -> CallbackResult {
    if let Some(error) = params.get("error") {
        return Err(CallbackError::Denied {
            error: error.clone(),
            description: params.get("error_description").cloned(),
        });
    }
    match params.get("code").filter(|c| !c.is_empty()) {
        Some(code) => Ok(CallbackParams {
            code: code.clone(),
            state: params.get("state").cloned().unwrap_or_default(),
        }),
        None => Err(CallbackError::MissingCode),
    }
}

fn render_page(title: &str, message: &str) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body style=\"font-family: sans-serif; margin: 3em\"><h1>{title}</h1><p>{}</p></body></html>",
        escape_html(message)
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
#[path = "callback_tests.rs"]
mod tests;
