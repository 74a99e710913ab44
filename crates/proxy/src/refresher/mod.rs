// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background token refresher.
//!
//! Owns the token lifecycle: periodic expiry checks, proactive refresh,
//! retry backoff, and escalation to interactive re-authentication when
//! the refresh token stops working.
//!
//! ```text
//!            permanent failure
//!   Idle ──────────────────────────▶ NeedsReauth
//!    ▲                                   │ begin interactive login
//!    │ login saved /                     ▼
//!    │ fresh token on disk        ReauthInProgress
//!    └───────────────────────────────────┘
//! ```

pub mod backoff;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::login::{self, BrowserOpener};
use crate::oauth::{OAuthClient, OAuthError};
use crate::refresher::backoff::FailureKind;
use crate::store::{StoreError, TokenSet, TokenStore};

/// Body used by the forced-reauth override; classified like a real rejection.
const FORCED_REAUTH_BODY: &str = "invalid_grant: forced re-authentication";

/// Refresher tuning, built once from [`ProxyConfig`](crate::config::ProxyConfig).
#[derive(Debug, Clone)]
pub struct RefresherConfig {
    pub check_interval: Duration,
    /// Refresh when the token expires within this window.
    pub refresh_threshold: Duration,
    /// Refresh when the last refresh is older than this, whatever the expiry says.
    pub backup_threshold: Duration,
    pub reauth_timeout: Duration,
    /// Consecutive transient failures before a persistent warning.
    pub max_transient_failures: u32,
    /// Treat every refresh attempt as a permanent failure.
    pub force_reauth: bool,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5 * 60),
            refresh_threshold: Duration::from_secs(50 * 60),
            backup_threshold: Duration::from_secs(55 * 60),
            reauth_timeout: Duration::from_secs(5 * 60),
            max_transient_failures: 5,
            force_reauth: false,
        }
    }
}

#[derive(Debug, Default)]
struct RefresherState {
    retry_count: u32,
    last_refresh: Option<DateTime<Utc>>,
    needs_reauth: bool,
    reauth_in_progress: bool,
    /// Pending backoff; replaces the check interval for the next sleep.
    retry_delay: Option<Duration>,
    /// Operator-facing warning after repeated transient failures.
    warning: Option<String>,
}

/// Externally visible state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    NeedsReauth,
    ReauthInProgress,
}

/// Snapshot for the status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefresherStatus {
    pub phase: Phase,
    pub retry_count: u32,
    pub last_refresh: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_secs: Option<u64>,
    /// The background loop has terminated; no further refreshes will run.
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// Another caller refreshed while this one waited for the lock.
    AlreadyFresh,
}

/// A classified refresh failure. The refresher has already acted on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} refresh failure: {message}")]
pub struct RefreshFailure {
    pub kind: FailureKind,
    pub retry_after: Option<Duration>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReauthOutcome {
    Started,
    AlreadyInProgress,
}

pub struct Refresher {
    store: TokenStore,
    oauth: Arc<OAuthClient>,
    opener: Arc<dyn BrowserOpener>,
    config: RefresherConfig,
    state: Mutex<RefresherState>,
    /// Serializes network refreshes; never held with `state`.
    refresh_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    reauth_task: Mutex<Option<JoinHandle<()>>>,
    degraded: AtomicBool,
}

impl std::fmt::Debug for Refresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refresher")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Refresher {
    pub fn new(
        store: TokenStore,
        oauth: Arc<OAuthClient>,
        opener: Arc<dyn BrowserOpener>,
        config: RefresherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            oauth,
            opener,
            config,
            state: Mutex::new(RefresherState::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            reauth_task: Mutex::new(None),
            degraded: AtomicBool::new(false),
        })
    }

    /// Spawn the background loop. Calling again while it runs is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let inner = tokio::spawn(Arc::clone(self).run_loop());
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move { this.supervise(inner).await }));
        tracing::info!(
            check_interval_secs = self.config.check_interval.as_secs(),
            refresh_threshold_mins = self.config.refresh_threshold.as_secs() / 60,
            "token refresher started"
        );
    }

    /// Stop the loop and any re-authentication, returning once both have exited.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let reauth = self.reauth_task.lock().take();
        if let Some(reauth) = reauth {
            let _ = reauth.await;
        }
        tracing::info!("token refresher stopped");
    }

    async fn supervise(&self, inner: JoinHandle<()>) {
        match inner.await {
            Ok(()) => tracing::debug!("refresher loop exited"),
            Err(e) => {
                self.degraded.store(true, Ordering::SeqCst);
                tracing::error!(
                    err = %e,
                    "token refresher loop terminated unexpectedly; no further token refreshes will occur"
                );
            }
        }
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if let Err(panic) = AssertUnwindSafe(self.check()).catch_unwind().await {
                tracing::error!(reason = %panic_message(&*panic), "token check panicked");
            }
            let delay = self.state.lock().retry_delay.unwrap_or(self.config.check_interval);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One scheduled check. Never fails; outcomes become state transitions.
    pub async fn check(self: &Arc<Self>) {
        let (needs_reauth, in_progress) = {
            let s = self.state.lock();
            (s.needs_reauth, s.reauth_in_progress)
        };
        if in_progress {
            tracing::debug!("re-authentication in progress, skipping check");
            return;
        }
        if needs_reauth {
            if self.fresh_token_on_disk() {
                tracing::info!("found a fresh token on disk, re-authentication no longer needed");
                self.clear_needs_reauth();
            } else {
                self.trigger_reauth();
            }
            return;
        }

        let token = match self.store.load() {
            Ok(t) => t,
            Err(e) if e.is_not_found() => {
                tracing::debug!("no token on disk, nothing to refresh");
                return;
            }
            Err(e) => {
                tracing::warn!(err = %e, "cannot read token for refresh check");
                return;
            }
        };
        if !self.needs_refresh(&token) {
            tracing::debug!(expires_at = %token.expires_at, "token does not need refresh");
            return;
        }
        match self.refresh_from(&token).await {
            Ok(outcome) => tracing::debug!(?outcome, "scheduled refresh done"),
            Err(failure) => tracing::debug!(kind = %failure.kind, "scheduled refresh failed"),
        }
    }

    pub fn needs_refresh(&self, token: &TokenSet) -> bool {
        self.needs_refresh_at(token, Utc::now())
    }

    /// Expiring within the refresh threshold, or last refreshed longer ago
    /// than the backup threshold.
    pub fn needs_refresh_at(&self, token: &TokenSet, now: DateTime<Utc>) -> bool {
        let threshold = TimeDelta::from_std(self.config.refresh_threshold).unwrap_or(TimeDelta::MAX);
        if token.expires_in(now) <= threshold {
            return true;
        }
        let backup = TimeDelta::from_std(self.config.backup_threshold).unwrap_or(TimeDelta::MAX);
        self.state.lock().last_refresh.is_some_and(|last| now.signed_duration_since(last) > backup)
    }

    /// Perform one refresh attempt against whatever token is stored now.
    pub async fn force_refresh(self: &Arc<Self>) -> Result<RefreshOutcome, RefreshFailure> {
        let observed = self.store.load().ok();
        self.refresh_after(observed.as_ref()).await
    }

    /// Refresh a token the caller loaded and judged stale.
    ///
    /// Concurrent callers serialize on the refresh lock. A caller that finds
    /// `observed` already replaced with a fresh token returns
    /// [`RefreshOutcome::AlreadyFresh`] without a network call.
    pub async fn refresh_from(
        self: &Arc<Self>,
        observed: &TokenSet,
    ) -> Result<RefreshOutcome, RefreshFailure> {
        self.refresh_after(Some(observed)).await
    }

    async fn refresh_after(
        self: &Arc<Self>,
        observed: Option<&TokenSet>,
    ) -> Result<RefreshOutcome, RefreshFailure> {
        let _guard = self.refresh_lock.lock().await;

        let current = match self.store.load() {
            Ok(t) => t,
            Err(e) => return Err(self.record_failure(store_failure_kind(&e), e.to_string())),
        };
        if observed != Some(&current) && !current.is_expiring_soon(self.config.refresh_threshold) {
            tracing::debug!("token refreshed by another caller");
            return Ok(RefreshOutcome::AlreadyFresh);
        }
        // The stored refresh token was already rejected; only a login helps.
        if self.state.lock().needs_reauth {
            tracing::debug!("re-authentication pending, not retrying the refresh token");
            return Err(RefreshFailure {
                kind: FailureKind::Permanent,
                retry_after: None,
                message: "refresh token rejected; re-authentication pending".to_owned(),
            });
        }
        if current.refresh_token.is_empty() {
            return Err(self.record_failure(FailureKind::Permanent, "no refresh token".to_owned()));
        }

        let result = if self.config.force_reauth {
            Err(OAuthError::RequestFailed { status: 400, body: FORCED_REAUTH_BODY.to_owned() })
        } else {
            self.oauth.refresh_tokens(&current.refresh_token).await
        };
        let tokens = match result
            .and_then(|resp| TokenSet::from_response(resp, Some(&current.refresh_token), Utc::now()))
        {
            Ok(t) => t,
            Err(e) => return Err(self.record_failure(backoff::classify(&e), e.to_string())),
        };
        if let Err(e) = self.store.save(&tokens) {
            return Err(self.record_failure(FailureKind::Transient, e.to_string()));
        }

        let mut s = self.state.lock();
        s.retry_count = 0;
        s.last_refresh = Some(Utc::now());
        s.retry_delay = None;
        s.warning = None;
        drop(s);
        tracing::info!(expires_at = %tokens.expires_at, "token refreshed");
        Ok(RefreshOutcome::Refreshed)
    }

    fn record_failure(self: &Arc<Self>, kind: FailureKind, message: String) -> RefreshFailure {
        let retry_after = match kind {
            FailureKind::Permanent => {
                self.state.lock().retry_delay = None;
                tracing::warn!(err = %message, "refresh token rejected, re-authentication required");
                self.trigger_reauth();
                None
            }
            FailureKind::RateLimited | FailureKind::Transient => {
                let mut s = self.state.lock();
                s.retry_count += 1;
                let delay = backoff::retry_delay(kind, s.retry_count);
                s.retry_delay = delay;
                let retry_count = s.retry_count;
                let persistent = kind == FailureKind::Transient
                    && retry_count >= self.config.max_transient_failures;
                if persistent {
                    s.warning = Some(format!(
                        "token refresh has failed {retry_count} times in a row: {message}"
                    ));
                }
                drop(s);
                let retry_in_secs = delay.map(|d| d.as_secs());
                if persistent {
                    tracing::error!(
                        retry_count,
                        retry_in_secs,
                        err = %message,
                        "token refresh keeps failing; the current token stays in use until it expires"
                    );
                } else {
                    tracing::warn!(retry_count, retry_in_secs, %kind, err = %message, "token refresh failed");
                }
                delay
            }
        };
        RefreshFailure { kind, retry_after, message }
    }

    /// Mark re-authentication needed and start the interactive flow unless
    /// one is already running.
    pub fn trigger_reauth(self: &Arc<Self>) -> ReauthOutcome {
        {
            let mut s = self.state.lock();
            s.needs_reauth = true;
            if s.reauth_in_progress {
                return ReauthOutcome::AlreadyInProgress;
            }
            s.reauth_in_progress = true;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_reauth().await });
        *self.reauth_task.lock() = Some(handle);
        ReauthOutcome::Started
    }

    async fn run_reauth(&self) {
        tracing::warn!("starting interactive re-authentication");
        let login = login::interactive_login(&self.oauth, self.opener.as_ref(), self.config.reauth_timeout);
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => Err("shutting down".to_owned()),
            r = AssertUnwindSafe(login).catch_unwind() => match r {
                Ok(Ok(tokens)) => self.store.save(&tokens).map_err(|e| e.to_string()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(panic) => Err(format!("login panicked: {}", panic_message(&*panic))),
            },
        };

        let mut s = self.state.lock();
        s.reauth_in_progress = false;
        match result {
            Ok(()) => {
                s.needs_reauth = false;
                s.retry_count = 0;
                s.retry_delay = None;
                s.warning = None;
                s.last_refresh = Some(Utc::now());
                drop(s);
                tracing::info!("re-authentication complete");
            }
            Err(e) => {
                drop(s);
                tracing::warn!(err = %e, "re-authentication failed, will retry on the next check");
            }
        }
    }

    /// Out-of-band recovery: return to idle with fresh counters.
    pub fn clear_needs_reauth(&self) {
        let mut s = self.state.lock();
        s.needs_reauth = false;
        s.retry_count = 0;
        s.last_refresh = None;
        s.retry_delay = None;
        s.warning = None;
    }

    pub fn status(&self) -> RefresherStatus {
        let s = self.state.lock();
        let phase = if s.reauth_in_progress {
            Phase::ReauthInProgress
        } else if s.needs_reauth {
            Phase::NeedsReauth
        } else {
            Phase::Idle
        };
        RefresherStatus {
            phase,
            retry_count: s.retry_count,
            last_refresh: s.last_refresh,
            retry_in_secs: s.retry_delay.map(|d| d.as_secs()),
            degraded: self.degraded.load(Ordering::SeqCst),
            warning: s.warning.clone(),
        }
    }

    fn fresh_token_on_disk(&self) -> bool {
        self.store.load().is_ok_and(|t| !t.is_expiring_soon(self.config.refresh_threshold))
    }
}

/// A missing token needs a login; an unreadable one is replaced by one.
fn store_failure_kind(err: &StoreError) -> FailureKind {
    match err {
        StoreError::NotFound(_) | StoreError::Parse { .. } => FailureKind::Permanent,
        StoreError::Io { .. } => FailureKind::Transient,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
#[path = "refresher_tests.rs"]
mod tests;
