// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use chrono::TimeDelta;
use yare::parameterized;

use super::*;
use crate::oauth::OAuthClient;
use crate::proxy::ProxySettings;
use crate::refresher::{Refresher, RefresherConfig};
use crate::store::TokenStore;
use crate::test_support::{mock_token_server, sample_tokens, token_body, CallbackOpener, MockTokenServer};

#[parameterized(
    key_item = { "/key/abc", true },
    keys = { "/keys", true },
    keys_sub = { "/keys/123/revoke", true },
    api_keys = { "/api-keys", true },
    v1_keys = { "/v1/keys", true },
    v1_api_keys = { "/v1/api-keys/x", true },
    api_keys_alt = { "/api/keys", true },
    chat = { "/v1/chat/completions", false },
    keyboard = { "/keyboard", false },
    keystore = { "/v1/keystore", false },
    root = { "/", false },
)]
fn management_paths(path: &str, expected: bool) {
    assert_eq!(is_management_path(path), expected);
}

fn state(dir: &std::path::Path, api_key: Option<&str>, refresher: Option<Arc<Refresher>>) -> anyhow::Result<ProxyState> {
    let settings = ProxySettings::new("http://upstream.invalid", api_key.map(str::to_owned), "x-api-key")?;
    ProxyState::new(settings, TokenStore::new(dir.join("tokens.json")), refresher, 0)
}

fn refresher_for(server: &MockTokenServer, dir: &std::path::Path) -> anyhow::Result<Arc<Refresher>> {
    let oauth = Arc::new(OAuthClient::new(server.oauth_config())?);
    Ok(Refresher::new(
        TokenStore::new(dir.join("tokens.json")),
        oauth,
        Arc::new(CallbackOpener::ignore()),
        RefresherConfig { reauth_timeout: std::time::Duration::from_millis(50), ..RefresherConfig::default() },
    ))
}

#[tokio::test]
async fn api_key_wins_for_regular_paths() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let state = state(dir.path(), Some("sk-static"), None)?;
    let cred = resolve_credential(&state, "/v1/chat/completions").await;
    assert_eq!(
        cred,
        Credential::ApiKey { header: HeaderName::from_static("x-api-key"), value: "sk-static".to_owned() }
    );
    Ok(())
}

#[tokio::test]
async fn management_path_uses_bearer_even_with_api_key() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let state = state(dir.path(), Some("sk-static"), None)?;
    let tokens = sample_tokens("mgmt", TimeDelta::hours(1));
    state.store.save(&tokens)?;

    let cred = resolve_credential(&state, "/v1/keys").await;
    assert_eq!(cred, Credential::Bearer(tokens.id_token));
    Ok(())
}

#[tokio::test]
async fn missing_token_forwards_without_credentials() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let state = state(dir.path(), None, None)?;
    assert_eq!(resolve_credential(&state, "/v1/models").await, Credential::Missing);
    Ok(())
}

#[tokio::test]
async fn expired_token_without_refresher_is_still_attached() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let state = state(dir.path(), None, None)?;
    let tokens = sample_tokens("stale", TimeDelta::minutes(-10));
    state.store.save(&tokens)?;

    assert_eq!(resolve_credential(&state, "/v1/models").await, Credential::Bearer(tokens.id_token));
    Ok(())
}

#[tokio::test]
async fn failed_inline_refresh_degrades_to_stale_token() -> anyhow::Result<()> {
    let server = mock_token_server(vec![(503, "unavailable".to_owned())]).await?;
    let dir = tempfile::tempdir()?;
    let state = state(dir.path(), None, Some(refresher_for(&server, dir.path())?))?;
    let tokens = sample_tokens("stale", TimeDelta::minutes(-10));
    state.store.save(&tokens)?;

    assert_eq!(resolve_credential(&state, "/v1/models").await, Credential::Bearer(tokens.id_token));
    assert_eq!(server.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn revoked_refresh_token_is_not_resent_per_request() -> anyhow::Result<()> {
    let body = r#"{"error":"invalid_grant"}"#.to_owned();
    let server = mock_token_server(vec![(400, body)]).await?;
    let dir = tempfile::tempdir()?;
    let state = state(dir.path(), None, Some(refresher_for(&server, dir.path())?))?;
    let tokens = sample_tokens("revoked", TimeDelta::minutes(-10));
    state.store.save(&tokens)?;

    for _ in 0..4 {
        let cred = resolve_credential(&state, "/v1/models").await;
        assert_eq!(cred, Credential::Bearer(tokens.id_token.clone()));
    }
    assert_eq!(server.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn expired_token_is_refreshed_inline() -> anyhow::Result<()> {
    let server = mock_token_server(vec![(200, token_body("inline", TimeDelta::hours(1)))]).await?;
    let dir = tempfile::tempdir()?;
    let state = state(dir.path(), None, Some(refresher_for(&server, dir.path())?))?;
    state.store.save(&sample_tokens("stale", TimeDelta::minutes(-10)))?;

    let cred = resolve_credential(&state, "/v1/models").await;
    let fresh = state.store.load()?;
    assert_eq!(fresh.access_token, "access-inline");
    assert_eq!(cred, Credential::Bearer(fresh.id_token));
    Ok(())
}

#[tokio::test]
async fn valid_token_does_not_refresh() -> anyhow::Result<()> {
    let server = mock_token_server(vec![(200, token_body("unused", TimeDelta::hours(1)))]).await?;
    let dir = tempfile::tempdir()?;
    let state = state(dir.path(), None, Some(refresher_for(&server, dir.path())?))?;
    // Inside the warning window but not expired.
    let tokens = sample_tokens("soon", TimeDelta::minutes(2));
    state.store.save(&tokens)?;

    assert_eq!(resolve_credential(&state, "/v1/models").await, Credential::Bearer(tokens.id_token));
    assert_eq!(server.calls(), 0);
    Ok(())
}

#[test]
fn apply_replaces_inbound_auth() -> anyhow::Result<()> {
    let header = HeaderName::from_static("x-api-key");
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer client-supplied"));
    headers.insert(header.clone(), HeaderValue::from_static("client-key"));

    apply(&mut headers, &header, &Credential::Bearer("jwt".to_owned()));
    assert_eq!(headers.get(AUTHORIZATION).map(|v| v.to_str().ok()), Some(Some("Bearer jwt")));
    assert!(headers.get(&header).is_none());

    apply(
        &mut headers,
        &header,
        &Credential::ApiKey { header: header.clone(), value: "sk".to_owned() },
    );
    assert!(headers.get(AUTHORIZATION).is_none());
    assert_eq!(headers.get(&header).map(|v| v.to_str().ok()), Some(Some("sk")));

    apply(&mut headers, &header, &Credential::Missing);
    assert!(headers.is_empty());
    Ok(())
}

#[test]
fn debug_hides_secrets() {
    let cred = Credential::Bearer("secret-jwt".to_owned());
    assert!(!format!("{cred:?}").contains("secret"));
}
