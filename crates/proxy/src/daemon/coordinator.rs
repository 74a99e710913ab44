// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Start-or-reuse logic for the proxy daemon.

use std::fs::OpenOptions;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::config::{DaemonPaths, DAEMON_MARKER_ENV};
use crate::daemon::descriptor::ProxyDescriptor;
use crate::daemon::{process, DaemonError};
use crate::store::ensure_private_dir;
use crate::store::lock::{acquire_lock, FileLock};

/// How long an existing daemon gets to answer `/health`.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// How long a freshly spawned daemon gets to write its descriptor and answer.
pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period between SIGTERM and SIGKILL.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

const ANNOUNCE_POLL: Duration = Duration::from_millis(100);

/// Launches a detached daemon process.
pub trait DaemonSpawner: Send + Sync {
    fn spawn(&self, paths: &DaemonPaths, target_url: &str) -> Result<Child, DaemonError>;
}

/// Re-executes the current binary as `authproxy serve` with the daemon marker set.
///
/// Settings travel as `AUTHPROXY_*` environment variables so secrets never
/// appear on the command line.
#[derive(Debug, Clone, Default)]
pub struct ExecSpawner {
    env: Vec<(&'static str, String)>,
}

impl ExecSpawner {
    pub fn new(env: Vec<(&'static str, String)>) -> Self {
        Self { env }
    }
}

impl DaemonSpawner for ExecSpawner {
    fn spawn(&self, paths: &DaemonPaths, target_url: &str) -> Result<Child, DaemonError> {
        let exe = std::env::current_exe().map_err(DaemonError::Spawn)?;
        ensure_private_dir(&paths.dir).map_err(|e| DaemonError::io(&paths.dir, e))?;
        let log_path = paths.log_file();
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| DaemonError::io(&log_path, e))?;
        let log_err = log.try_clone().map_err(|e| DaemonError::io(&log_path, e))?;

        let mut cmd = Command::new(exe);
        cmd.arg("serve")
            .envs(self.env.iter().map(|(k, v)| (*k, v.as_str())))
            .env("AUTHPROXY_TARGET_URL", target_url)
            .env("AUTHPROXY_STATE_DIR", &paths.dir)
            .env(DAEMON_MARKER_ENV, "1")
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err);
        // Own process group: terminal signals aimed at the CLI don't reach the daemon.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd.spawn().map_err(DaemonError::Spawn)
    }
}

#[derive(Debug, Deserialize)]
struct HealthProbe {
    pid: u32,
}

/// Finds, starts, and stops the single per-machine proxy daemon.
pub struct Coordinator {
    paths: DaemonPaths,
    target_url: String,
    spawner: Arc<dyn DaemonSpawner>,
    http: reqwest::Client,
    announce_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        paths: DaemonPaths,
        target_url: &str,
        spawner: Arc<dyn DaemonSpawner>,
    ) -> Result<Self, DaemonError> {
        crate::ensure_crypto();
        let http = reqwest::Client::builder().no_proxy().timeout(HEALTH_PROBE_TIMEOUT).build()?;
        Ok(Self {
            paths,
            target_url: target_url.to_owned(),
            spawner,
            http,
            announce_timeout: ANNOUNCE_TIMEOUT,
        })
    }

    pub fn with_announce_timeout(mut self, timeout: Duration) -> Self {
        self.announce_timeout = timeout;
        self
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.paths
    }

    /// Return the running daemon, starting one if needed.
    ///
    /// A live daemon for a different upstream is stopped and replaced.
    pub async fn ensure_running(&self) -> Result<ProxyDescriptor, DaemonError> {
        let _lock = self.startup_lock().await?;
        let desc_path = self.paths.descriptor();

        if let Some(desc) = ProxyDescriptor::load(&desc_path) {
            if !self.is_healthy(&desc).await {
                tracing::info!(pid = desc.pid, port = desc.port, "removing stale proxy descriptor");
            } else if normalize_target(&desc.target_url) == normalize_target(&self.target_url) {
                tracing::debug!(pid = desc.pid, port = desc.port, "reusing running proxy");
                return Ok(desc);
            } else {
                tracing::info!(
                    pid = desc.pid,
                    old = %desc.target_url,
                    new = %self.target_url,
                    "upstream target changed, restarting proxy"
                );
                process::terminate(desc.pid, STOP_GRACE).await?;
            }
        }
        ProxyDescriptor::remove(&desc_path).map_err(|e| DaemonError::io(&desc_path, e))?;

        let child = self.spawner.spawn(&self.paths, &self.target_url)?;
        self.wait_for_announce(child).await
    }

    /// The running daemon, if one answers. Never starts anything.
    pub async fn running(&self) -> Option<ProxyDescriptor> {
        let desc = ProxyDescriptor::load(&self.paths.descriptor())?;
        self.is_healthy(&desc).await.then_some(desc)
    }

    /// Stop the daemon and remove its descriptor. Returns the stopped daemon.
    ///
    /// A recorded pid that does not answer as the proxy is never signalled.
    pub async fn stop(&self) -> Result<Option<ProxyDescriptor>, DaemonError> {
        let _lock = self.startup_lock().await?;
        let desc_path = self.paths.descriptor();
        let desc = ProxyDescriptor::load(&desc_path);

        if let Some(d) = &desc {
            if self.is_healthy(d).await {
                process::terminate(d.pid, STOP_GRACE).await?;
                tracing::info!(pid = d.pid, "proxy stopped");
            } else if process::pid_alive(d.pid) {
                tracing::warn!(pid = d.pid, "recorded pid does not answer as the proxy, not signalling it");
            }
        }
        ProxyDescriptor::remove(&desc_path).map_err(|e| DaemonError::io(&desc_path, e))?;
        Ok(desc)
    }

    async fn startup_lock(&self) -> Result<FileLock, DaemonError> {
        ensure_private_dir(&self.paths.dir).map_err(|e| DaemonError::io(&self.paths.dir, e))?;
        let path = self.paths.startup_lock();
        let lock_path = path.clone();
        tokio::task::spawn_blocking(move || acquire_lock(&lock_path))
            .await
            .map_err(|e| DaemonError::io(&path, std::io::Error::other(e)))?
            .map_err(|e| DaemonError::io(&path, e))
    }

    /// Alive, answering `/health` in time, and reporting the recorded pid.
    async fn is_healthy(&self, desc: &ProxyDescriptor) -> bool {
        if !process::pid_alive(desc.pid) {
            return false;
        }
        let url = format!("{}/health", desc.base_url());
        let resp = match self.http.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::debug!(%url, status = %r.status(), "proxy health probe failed");
                return false;
            }
            Err(e) => {
                tracing::debug!(%url, err = %e, "proxy health probe failed");
                return false;
            }
        };
        matches!(resp.json::<HealthProbe>().await, Ok(h) if h.pid == desc.pid)
    }

    async fn wait_for_announce(&self, mut child: Child) -> Result<ProxyDescriptor, DaemonError> {
        let pid = child.id();
        let deadline = tokio::time::Instant::now() + self.announce_timeout;
        loop {
            let exited = match child.try_wait() {
                Ok(status) => status.map(|s| s.to_string()),
                // Already collected by a liveness probe.
                Err(e) => Some(e.to_string()),
            };
            if let Some(status) = exited {
                return Err(DaemonError::ExitedEarly { pid, status, log: self.paths.log_file() });
            }
            if let Some(desc) = ProxyDescriptor::load(&self.paths.descriptor()) {
                if desc.pid == pid && self.is_healthy(&desc).await {
                    tracing::info!(pid, port = desc.port, target = %desc.target_url, "proxy started");
                    return Ok(desc);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DaemonError::StartTimeout {
                    pid,
                    timeout: self.announce_timeout,
                    log: self.paths.log_file(),
                });
            }
            tokio::time::sleep(ANNOUNCE_POLL).await;
        }
    }
}

/// Canonical form of an upstream URL for mismatch detection.
///
/// Trailing slashes and a trailing `/v1` API version segment are ignored.
pub fn normalize_target(url: &str) -> String {
    let trimmed = url.trim();
    let base = match url::Url::parse(trimmed) {
        Ok(parsed) => {
            let mut s = format!("{}://{}", parsed.scheme(), parsed.host_str().unwrap_or_default());
            if let Some(port) = parsed.port() {
                s.push_str(&format!(":{port}"));
            }
            s.push_str(parsed.path());
            s
        }
        Err(_) => trimmed.to_owned(),
    };
    let base = base.trim_end_matches('/');
    base.strip_suffix("/v1").unwrap_or(base).trim_end_matches('/').to_owned()
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
