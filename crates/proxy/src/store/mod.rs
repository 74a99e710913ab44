// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token persistence: lock-protected, atomically written JSON on local disk.
//!
//! Writers serialize on a sibling `<path>.lock` file and publish through
//! `<path>.tmp` + rename, so readers only ever see a complete file and
//! never need the lock themselves.

pub mod lock;

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::store::lock::acquire_lock;

/// Buffer applied by [`TokenSet::is_expired`] to absorb clock skew.
pub const CLOCK_SKEW: Duration = Duration::from_secs(30);

/// The persisted credential state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub id_token: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    /// Informational only, taken from the ID token claims.
    #[serde(default)]
    pub email: String,
}

impl TokenSet {
    /// True when `now + 30s` is past `expires_at`.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_expiring_soon_at(CLOCK_SKEW, now)
    }

    /// True when `now + window` is past `expires_at`.
    pub fn is_expiring_soon(&self, window: Duration) -> bool {
        self.is_expiring_soon_at(window, Utc::now())
    }

    pub fn is_expiring_soon_at(&self, window: Duration, now: DateTime<Utc>) -> bool {
        match TimeDelta::from_std(window).ok().and_then(|d| now.checked_add_signed(d)) {
            Some(deadline) => deadline > self.expires_at,
            None => true,
        }
    }

    /// Signed time until expiry (negative once expired).
    pub fn expires_in(&self, now: DateTime<Utc>) -> TimeDelta {
        self.expires_at.signed_duration_since(now)
    }
}

/// Token store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no token file at {0}")]
    NotFound(PathBuf),
    #[error("malformed token file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("token file I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }
}

/// Handle to a token file on disk.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<TokenSet, StoreError> {
        load(&self.path)
    }

    pub fn save(&self, tokens: &TokenSet) -> Result<(), StoreError> {
        save(&self.path, tokens)
    }

    /// Remove the token file. Returns whether a file existed.
    pub fn delete(&self) -> Result<bool, StoreError> {
        delete(&self.path)
    }
}

/// Read and parse the token file.
pub fn load(path: &Path) -> Result<TokenSet, StoreError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(path.to_path_buf()))
        }
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_str(&contents)
        .map_err(|source| StoreError::Parse { path: path.to_path_buf(), source })
}

/// Persist `tokens` under the exclusive token lock (write tmp + rename).
pub fn save(path: &Path, tokens: &TokenSet) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(tokens)
        .map_err(|source| StoreError::Parse { path: path.to_path_buf(), source })?;
    write_atomic(path, &json).map_err(|e| StoreError::io(path, e))?;
    tracing::debug!(path = %path.display(), expires_at = %tokens.expires_at, "saved tokens");
    Ok(())
}

/// Delete the token file. Deleting a missing file is not an error.
pub fn delete(path: &Path) -> Result<bool, StoreError> {
    if path.parent().is_some_and(|p| !p.as_os_str().is_empty() && !p.exists()) {
        return Ok(false);
    }
    let _lock = acquire_lock(&sibling(path, "lock")).map_err(|e| StoreError::io(path, e))?;
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Write `bytes` to `path` atomically while holding `<path>.lock`.
///
/// The parent directory is created owner-only; the file is owner read/write.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_private_dir(parent)?;
    }
    let _lock = acquire_lock(&sibling(path, "lock"))?;

    let tmp = sibling(path, "tmp");
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)
}

/// Create `dir` (and parents) with owner-only access if missing.
pub(crate) fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

/// `<path>.<suffix>` next to `path`.
pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    path.with_file_name(format!("{name}.{suffix}"))
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
