// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use crate::oauth::OAuthConfig;
use crate::refresher::RefresherConfig;

/// Default local port for the OAuth redirect listener.
pub const DEFAULT_CALLBACK_PORT: u16 = 8400;

/// Environment marker telling a spawned child that it is the daemon.
pub const DAEMON_MARKER_ENV: &str = "AUTHPROXY_DAEMON";

/// Configuration shared by every `authproxy` subcommand.
///
/// The spawned daemon re-parses the same flags and environment, so the
/// parent CLI and the daemon always agree on paths and endpoints.
#[derive(Debug, Clone, clap::Args)]
pub struct ProxyConfig {
    /// Directory for tokens, the daemon descriptor, lock files and logs.
    #[arg(long, global = true, env = "AUTHPROXY_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Token file path (defaults to `<state-dir>/tokens.json`).
    #[arg(long, global = true, env = "AUTHPROXY_TOKEN_FILE")]
    pub token_file: Option<PathBuf>,

    /// Upstream API base URL that proxied requests are forwarded to.
    #[arg(long, global = true, env = "AUTHPROXY_TARGET_URL")]
    pub target_url: Option<String>,

    /// Local proxy port (0 picks an ephemeral port).
    #[arg(long, global = true, default_value_t = 0, env = "AUTHPROXY_PORT")]
    pub port: u16,

    /// OIDC issuer URL, used for endpoint discovery.
    #[arg(long, global = true, env = "AUTHPROXY_ISSUER")]
    pub issuer: Option<String>,

    /// OAuth authorization endpoint (skips discovery when set with --token-endpoint).
    #[arg(long, global = true, env = "AUTHPROXY_AUTHORIZE_ENDPOINT")]
    pub authorize_endpoint: Option<String>,

    /// OAuth token endpoint.
    #[arg(long, global = true, env = "AUTHPROXY_TOKEN_ENDPOINT")]
    pub token_endpoint: Option<String>,

    /// OAuth client ID. Bearer mode is disabled when unset.
    #[arg(long, global = true, env = "AUTHPROXY_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Loopback port for the OAuth redirect callback.
    #[arg(long, global = true, default_value_t = DEFAULT_CALLBACK_PORT, env = "AUTHPROXY_CALLBACK_PORT")]
    pub callback_port: u16,

    /// Static API key. When set, non-management requests use it instead of the bearer token.
    #[arg(long, global = true, env = "AUTHPROXY_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Header carrying the static API key.
    #[arg(long, global = true, default_value = "x-api-key", env = "AUTHPROXY_API_KEY_HEADER")]
    pub api_key_header: String,

    /// Seconds between background token checks.
    #[arg(long, global = true, default_value_t = 300, env = "AUTHPROXY_CHECK_INTERVAL_SECS")]
    pub check_interval_secs: u64,

    /// Refresh when the token expires within this many minutes.
    #[arg(long, global = true, default_value_t = 50, env = "AUTHPROXY_REFRESH_THRESHOLD_MINS")]
    pub refresh_threshold_mins: u64,

    /// Force a refresh when the last one is older than this many minutes.
    #[arg(long, global = true, default_value_t = 55, env = "AUTHPROXY_BACKUP_THRESHOLD_MINS")]
    pub backup_threshold_mins: u64,

    /// Seconds to wait for the browser callback during re-authentication.
    #[arg(long, global = true, default_value_t = 300, env = "AUTHPROXY_REAUTH_TIMEOUT_SECS")]
    pub reauth_timeout_secs: u64,

    /// Consecutive transient refresh failures before warning the operator.
    #[arg(long, global = true, default_value_t = 5, env = "AUTHPROXY_MAX_TRANSIENT_FAILURES")]
    pub max_transient_failures: u32,

    /// Treat every refresh as a permanent failure (exercises the reauth path).
    #[arg(long, global = true, env = "AUTHPROXY_FORCE_REAUTH")]
    pub force_reauth: bool,

    /// Log format (json or text).
    #[arg(long, global = true, default_value = "text", env = "AUTHPROXY_LOG_FORMAT")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info", env = "AUTHPROXY_LOG_LEVEL")]
    pub log_level: String,
}

impl ProxyConfig {
    /// Resolved state directory.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(default_state_dir)
    }

    /// Resolved token file path.
    pub fn token_path(&self) -> PathBuf {
        self.token_file.clone().unwrap_or_else(|| self.state_dir().join("tokens.json"))
    }

    /// Paths used by the daemon coordinator.
    pub fn daemon_paths(&self) -> DaemonPaths {
        DaemonPaths::new(self.state_dir())
    }

    /// Upstream target, or an error telling the user how to set one.
    pub fn require_target(&self) -> anyhow::Result<String> {
        match self.target_url.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => Ok(t.trim_end_matches('/').to_owned()),
            _ => anyhow::bail!("no upstream configured: pass --target-url or set AUTHPROXY_TARGET_URL"),
        }
    }

    /// OAuth settings, present only when a client ID is configured.
    pub fn oauth_config(&self) -> Option<OAuthConfig> {
        let client_id = self.client_id.clone().filter(|c| !c.is_empty())?;
        Some(OAuthConfig {
            client_id,
            issuer: self.issuer.clone(),
            authorize_endpoint: self.authorize_endpoint.clone(),
            token_endpoint: self.token_endpoint.clone(),
            callback_port: self.callback_port,
        })
    }

    /// Require OAuth settings for commands that cannot work without them.
    pub fn require_oauth(&self) -> anyhow::Result<OAuthConfig> {
        self.oauth_config().ok_or_else(|| {
            anyhow::anyhow!("no OAuth client configured: pass --client-id or set AUTHPROXY_CLIENT_ID")
        })
    }

    pub fn refresher_config(&self) -> RefresherConfig {
        RefresherConfig {
            check_interval: Duration::from_secs(self.check_interval_secs),
            refresh_threshold: Duration::from_secs(self.refresh_threshold_mins.saturating_mul(60)),
            backup_threshold: Duration::from_secs(self.backup_threshold_mins.saturating_mul(60)),
            reauth_timeout: Duration::from_secs(self.reauth_timeout_secs),
            max_transient_failures: self.max_transient_failures,
            force_reauth: self.force_reauth,
        }
    }

    pub fn reauth_timeout(&self) -> Duration {
        Duration::from_secs(self.reauth_timeout_secs)
    }

    /// Static API key, ignoring empty values.
    pub fn api_key(&self) -> Option<String> {
        self.api_key.clone().filter(|k| !k.trim().is_empty())
    }

    /// Environment that reproduces this configuration in a spawned daemon.
    ///
    /// Flags given on the command line would otherwise be lost across the
    /// re-exec, and passing them as arguments would expose the API key in `ps`.
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            ("AUTHPROXY_STATE_DIR", self.state_dir().display().to_string()),
            ("AUTHPROXY_TOKEN_FILE", self.token_path().display().to_string()),
            ("AUTHPROXY_PORT", self.port.to_string()),
            ("AUTHPROXY_CALLBACK_PORT", self.callback_port.to_string()),
            ("AUTHPROXY_API_KEY_HEADER", self.api_key_header.clone()),
            ("AUTHPROXY_CHECK_INTERVAL_SECS", self.check_interval_secs.to_string()),
            ("AUTHPROXY_REFRESH_THRESHOLD_MINS", self.refresh_threshold_mins.to_string()),
            ("AUTHPROXY_BACKUP_THRESHOLD_MINS", self.backup_threshold_mins.to_string()),
            ("AUTHPROXY_REAUTH_TIMEOUT_SECS", self.reauth_timeout_secs.to_string()),
            ("AUTHPROXY_MAX_TRANSIENT_FAILURES", self.max_transient_failures.to_string()),
            ("AUTHPROXY_LOG_FORMAT", self.log_format.clone()),
            ("AUTHPROXY_LOG_LEVEL", self.log_level.clone()),
        ];
        let optional = [
            ("AUTHPROXY_TARGET_URL", &self.target_url),
            ("AUTHPROXY_ISSUER", &self.issuer),
            ("AUTHPROXY_AUTHORIZE_ENDPOINT", &self.authorize_endpoint),
            ("AUTHPROXY_TOKEN_ENDPOINT", &self.token_endpoint),
            ("AUTHPROXY_CLIENT_ID", &self.client_id),
            ("AUTHPROXY_API_KEY", &self.api_key),
        ];
        env.extend(optional.into_iter().filter_map(|(k, v)| v.clone().map(|v| (k, v))));
        if self.force_reauth {
            env.push(("AUTHPROXY_FORCE_REAUTH", "true".to_owned()));
        }
        env
    }
}

/// On-disk locations owned by the daemon coordinator.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub dir: PathBuf,
}

impl DaemonPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn descriptor(&self) -> PathBuf {
        self.dir.join("proxy.json")
    }

    /// Startup lock, distinct from the token lock.
    pub fn startup_lock(&self) -> PathBuf {
        self.dir.join("proxy.start.lock")
    }

    pub fn log_file(&self) -> PathBuf {
        self.dir.join("proxy.log")
    }
}

/// Resolve the default state directory.
///
/// Checks `AUTHPROXY_STATE_DIR`, then `$XDG_STATE_HOME/authproxy`,
/// then `$HOME/.local/state/authproxy`.
pub fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("AUTHPROXY_STATE_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(xdg).join("authproxy");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/state/authproxy");
    }
    PathBuf::from(".authproxy")
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
