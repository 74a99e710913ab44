// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Interactive browser login (authorization code + PKCE).

use std::io;
use std::time::Duration;

use chrono::Utc;

use crate::oauth::callback::CallbackServer;
use crate::oauth::pkce::{build_authorization_url, PkceSession};
use crate::oauth::{OAuthClient, OAuthError};
use crate::store::TokenSet;

/// Opens the authorization URL for the user.
pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str) -> io::Result<()>;
}

/// Launches the platform's default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) -> io::Result<()> {
        open::that(url)
    }
}

/// Run one interactive login attempt and return the resulting tokens.
///
/// Nothing is persisted here; callers decide where the tokens go.
pub async fn interactive_login(
    oauth: &OAuthClient,
    opener: &dyn BrowserOpener,
    timeout: Duration,
) -> Result<TokenSet, OAuthError> {
    let session = PkceSession::generate();
    let endpoints = oauth.endpoints().await?;
    let mut server = CallbackServer::bind(oauth.config().callback_port).await?;
    let redirect_uri = server.redirect_uri();

    let outcome = async {
        let url = build_authorization_url(
            &endpoints.authorize,
            &oauth.config().client_id,
            &redirect_uri,
            &session,
        )?;
        if let Err(e) = opener.open(url.as_str()) {
            tracing::warn!(err = %e, "could not launch a browser");
            eprintln!("Open this URL in a browser to sign in:\n\n  {url}\n");
        } else {
            tracing::info!(port = server.port(), "waiting for browser login");
        }
        Ok::<_, OAuthError>(server.wait_for_callback(timeout).await?)
    }
    .await;
    server.shutdown().await;
    let params = outcome?;

    if params.state != session.state {
        return Err(OAuthError::StateMismatch);
    }

    let resp = oauth.exchange_code(&params.code, &session.verifier, &redirect_uri).await?;
    let tokens = TokenSet::from_response(resp, None, Utc::now())?;
    tracing::info!(email = %tokens.email, expires_at = %tokens.expires_at, "login succeeded");
    Ok(tokens)
}

#[cfg(test)]
#[path = "login_tests.rs"]
mod tests;
