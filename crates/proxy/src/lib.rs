// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authproxy: local OAuth credential daemon and credential-injecting proxy.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod login;
pub mod oauth;
pub mod proxy;
pub mod refresher;
pub mod store;
pub mod test_support;

use std::sync::{Arc, Once};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ProxyConfig;
use crate::daemon::ProxyDescriptor;
use crate::login::SystemBrowser;
use crate::oauth::OAuthClient;
use crate::proxy::{build_router, ProxySettings, ProxyState};
use crate::refresher::Refresher;
use crate::store::{ensure_private_dir, TokenStore};

/// Install the process-wide rustls crypto provider exactly once.
pub fn ensure_crypto() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Run the proxy daemon until SIGTERM or SIGINT.
pub async fn run_daemon(config: ProxyConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());
    serve(config, shutdown).await
}

/// Serve the proxy until `shutdown` is cancelled.
///
/// The descriptor is written only after the socket is bound, and removed
/// on the way out if it still names this process.
pub async fn serve(config: ProxyConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    ensure_crypto();
    let target_url = config.require_target()?;
    let paths = config.daemon_paths();
    ensure_private_dir(&paths.dir)
        .with_context(|| format!("creating state dir {}", paths.dir.display()))?;

    let store = TokenStore::new(config.token_path());
    let refresher = match config.oauth_config() {
        Some(oauth) => {
            let client = Arc::new(OAuthClient::new(oauth)?);
            let refresher =
                Refresher::new(store.clone(), client, Arc::new(SystemBrowser), config.refresher_config());
            refresher.start();
            Some(refresher)
        }
        None => {
            if config.api_key().is_none() {
                warn!("no OAuth client or API key configured; requests are forwarded without credentials");
            }
            None
        }
    };

    let listener = TcpListener::bind(("127.0.0.1", config.port))
        .await
        .with_context(|| format!("binding 127.0.0.1:{}", config.port))?;
    let port = listener.local_addr()?.port();

    let settings = ProxySettings::new(&target_url, config.api_key(), &config.api_key_header)?;
    let state = Arc::new(ProxyState::new(settings, store, refresher.clone(), port)?);
    let router = build_router(state);

    let descriptor = ProxyDescriptor::current(port, &target_url);
    let desc_path = paths.descriptor();
    descriptor
        .save(&desc_path)
        .with_context(|| format!("writing {}", desc_path.display()))?;
    info!(port, pid = descriptor.pid, target = %target_url, "authproxy listening");

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await;

    if let Some(refresher) = &refresher {
        refresher.stop().await;
    }
    // A replacement daemon may already own the descriptor.
    if ProxyDescriptor::load(&desc_path).is_some_and(|d| d.pid == descriptor.pid) {
        if let Err(e) = ProxyDescriptor::remove(&desc_path) {
            warn!(path = %desc_path.display(), err = %e, "failed to remove descriptor");
        }
    }
    info!("authproxy stopped");
    result.context("proxy server")
}

#[cfg(unix)]
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();
        if sigterm.is_none() || sigint.is_none() {
            error!("failed to install signal handlers");
        }

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
            }
        }
        shutdown.cancel();
    });
}

#[cfg(not(unix))]
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl-C");
                shutdown.cancel();
            }
            Err(e) => error!(err = %e, "failed to install Ctrl-C handler"),
        }
    });
}
