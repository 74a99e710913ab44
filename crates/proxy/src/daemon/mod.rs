// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-instance daemon coordination across independent CLI invocations.

pub mod coordinator;
pub mod descriptor;
pub mod process;

use std::path::PathBuf;
use std::time::Duration;

pub use coordinator::{Coordinator, DaemonSpawner, ExecSpawner};
pub use descriptor::ProxyDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon state I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn the proxy daemon: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("proxy daemon (pid {pid}) exited during startup ({status}); see {}", log.display())]
    ExitedEarly { pid: u32, status: String, log: PathBuf },
    #[error("proxy daemon (pid {pid}) did not come up within {}s; see {}", timeout.as_secs(), log.display())]
    StartTimeout { pid: u32, timeout: Duration, log: PathBuf },
    #[error("could not stop pid {pid}: {reason}")]
    StopFailed { pid: u32, reason: String },
    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),
}

impl DaemonError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
