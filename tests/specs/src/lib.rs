// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Runs the real `authproxy` binary against an isolated state directory,
//! letting it spawn and stop its own background daemon.

use std::path::{Path, PathBuf};
use std::process::Output;

use authproxy::daemon::ProxyDescriptor;

pub use authproxy::ensure_crypto;

/// Resolve the path to the compiled `authproxy` binary.
pub fn authproxy_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("authproxy")
}

/// One isolated `authproxy` installation. Stops its daemon on drop.
pub struct Sandbox {
    binary: PathBuf,
    state_dir: tempfile::TempDir,
}

impl Sandbox {
    /// `None` when the binary has not been built yet.
    pub fn new() -> anyhow::Result<Option<Self>> {
        let binary = authproxy_binary();
        if !binary.exists() {
            eprintln!("skipping: authproxy binary not found at {}", binary.display());
            return Ok(None);
        }
        Ok(Some(Self { binary, state_dir: tempfile::tempdir()? }))
    }

    pub fn state_dir(&self) -> &Path {
        self.state_dir.path()
    }

    fn command(&self, args: &[&str]) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(args)
            .env("AUTHPROXY_STATE_DIR", self.state_dir.path())
            .env("AUTHPROXY_LOG_LEVEL", "warn")
            .env_remove("AUTHPROXY_DAEMON")
            .env_remove("AUTHPROXY_CLIENT_ID")
            .env_remove("AUTHPROXY_API_KEY")
            .env_remove("AUTHPROXY_TARGET_URL");
        cmd
    }

    /// Run one CLI invocation to completion.
    pub async fn run(&self, args: &[&str]) -> anyhow::Result<Output> {
        Ok(self.command(args).output().await?)
    }

    /// Run `start` against `target` and return the announced daemon.
    pub async fn start(&self, target: &str, extra: &[&str]) -> anyhow::Result<ProxyDescriptor> {
        let mut args = vec!["start", "--target-url", target];
        args.extend_from_slice(extra);
        let out = self.run(&args).await?;
        anyhow::ensure!(
            out.status.success(),
            "start failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        self.descriptor().ok_or_else(|| anyhow::anyhow!("no descriptor after start"))
    }

    pub fn descriptor(&self) -> Option<ProxyDescriptor> {
        ProxyDescriptor::load(&self.state_dir.path().join("proxy.json"))
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = std::process::Command::new(&self.binary)
            .arg("stop")
            .env("AUTHPROXY_STATE_DIR", self.state_dir.path())
            .env_remove("AUTHPROXY_DAEMON")
            .output();
    }
}
