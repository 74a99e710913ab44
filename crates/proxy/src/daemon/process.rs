// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Non-invasive process liveness checks and graceful termination.

use std::time::Duration;

use crate::daemon::DaemonError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time allowed for a process to die after the forceful kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Whether a process with `pid` exists. Never signals the process.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // 0 and negative values address process groups.
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    reap(raw);
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists, but owned by someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Collect `pid` if it is an exited child of ours, so it stops looking alive.
#[cfg(unix)]
fn reap(raw: i32) {
    use nix::sys::wait::{waitpid, WaitPidFlag};
    use nix::unistd::Pid;

    let _ = waitpid(Pid::from_raw(raw), Some(WaitPidFlag::WNOHANG));
}

#[cfg(not(unix))]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let filter = format!("PID eq {pid}");
    match std::process::Command::new("tasklist").args(["/FI", &filter, "/NH", "/FO", "CSV"]).output() {
        Ok(out) => String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\"")),
        Err(_) => false,
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32, force: bool) -> Result<(), DaemonError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| DaemonError::StopFailed { pid, reason: "pid out of range".to_owned() })?;
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(DaemonError::StopFailed { pid, reason: e.to_string() }),
    }
}

#[cfg(not(unix))]
fn send_terminate(pid: u32, force: bool) -> Result<(), DaemonError> {
    let pid_arg = pid.to_string();
    let mut cmd = std::process::Command::new("taskkill");
    cmd.args(["/PID", &pid_arg]);
    if force {
        cmd.arg("/F");
    }
    cmd.output()
        .map(|_| ())
        .map_err(|e| DaemonError::StopFailed { pid, reason: e.to_string() })
}

/// Ask `pid` to exit, escalating to a forceful kill after `grace`.
///
/// Returns whether the process was running.
pub async fn terminate(pid: u32, grace: Duration) -> Result<bool, DaemonError> {
    if !pid_alive(pid) {
        return Ok(false);
    }
    tracing::debug!(pid, "sending graceful termination");
    send_terminate(pid, false)?;
    if wait_for_exit(pid, grace).await {
        return Ok(true);
    }

    tracing::warn!(pid, grace_secs = grace.as_secs(), "process ignored graceful termination, killing");
    send_terminate(pid, true)?;
    if wait_for_exit(pid, KILL_GRACE).await {
        return Ok(true);
    }
    Err(DaemonError::StopFailed { pid, reason: "still running after kill".to_owned() })
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
