// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Refresh failure classification and retry schedules.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::oauth::client::has_rate_limit_marker;
use crate::oauth::OAuthError;

pub const TRANSIENT_BASE: Duration = Duration::from_secs(30);
pub const TRANSIENT_CAP: Duration = Duration::from_secs(5 * 60);
pub const RATE_LIMIT_BASE: Duration = Duration::from_secs(2 * 60);
pub const RATE_LIMIT_CAP: Duration = Duration::from_secs(10 * 60);

/// Doublings applied to the rate-limit base before the cap takes over.
const RATE_LIMIT_MAX_DOUBLINGS: u32 = 3;

/// Markers meaning the refresh token can never succeed again.
const PERMANENT_MARKERS: &[&str] = &[
    "invalid_grant",
    "refresh token expired",
    "refresh token has expired",
    "refresh token revoked",
    "token has been revoked",
    "user not found",
    "user_not_found",
    "user does not exist",
];

/// How a failed refresh should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Not retried; escalates to interactive re-authentication.
    Permanent,
    /// Retried on the long schedule.
    RateLimited,
    /// Network or server trouble, retried on the short schedule.
    Transient,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Permanent => "permanent",
            Self::RateLimited => "rate-limited",
            Self::Transient => "transient",
        })
    }
}

pub fn classify(err: &OAuthError) -> FailureKind {
    match err {
        OAuthError::RateLimited { .. } => FailureKind::RateLimited,
        OAuthError::Transport(_) => FailureKind::Transient,
        other => classify_message(&other.to_string()),
    }
}

/// Classify a failure from its text alone.
pub fn classify_message(message: &str) -> FailureKind {
    let lower = message.to_ascii_lowercase();
    if PERMANENT_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureKind::Permanent
    } else if lower.contains("429") || has_rate_limit_marker(&lower) {
        FailureKind::RateLimited
    } else {
        FailureKind::Transient
    }
}

/// Delay before retry number `attempt` (1-based). `None` for permanent failures.
pub fn retry_delay(kind: FailureKind, attempt: u32) -> Option<Duration> {
    let n = attempt.max(1) - 1;
    match kind {
        FailureKind::Permanent => None,
        FailureKind::Transient => Some(doubled(TRANSIENT_BASE, n).min(TRANSIENT_CAP)),
        FailureKind::RateLimited => {
            Some(doubled(RATE_LIMIT_BASE, n.min(RATE_LIMIT_MAX_DOUBLINGS)).min(RATE_LIMIT_CAP))
        }
    }
}

fn doubled(base: Duration, times: u32) -> Duration {
    base.checked_mul(2u32.saturating_pow(times)).unwrap_or(Duration::MAX)
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
