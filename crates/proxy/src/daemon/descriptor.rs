// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The running daemon's on-disk announcement.

use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    pub port: u16,
    pub pid: u32,
    pub started: DateTime<Utc>,
    pub target_url: String,
}

impl ProxyDescriptor {
    /// Descriptor for the current process.
    pub fn current(port: u16, target_url: &str) -> Self {
        Self { port, pid: std::process::id(), started: Utc::now(), target_url: target_url.to_owned() }
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Load the descriptor. Missing or malformed files read as `None`.
    pub fn load(path: &Path) -> Option<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), err = %e, "cannot read daemon descriptor");
                return None;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(d) => Some(d),
            Err(e) => {
                tracing::warn!(path = %path.display(), err = %e, "malformed daemon descriptor");
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)
    }

    /// Remove the descriptor file. Returns whether one existed.
    pub fn remove(path: &Path) -> io::Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
#[path = "descriptor_tests.rs"]
mod tests;
