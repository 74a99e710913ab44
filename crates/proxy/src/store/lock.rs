// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Exclusive advisory file locks.
//!
//! Callers use [`acquire_lock`] and [`FileLock::release`] (or drop the
//! guard); each platform supplies its own `sys` implementation.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// A held exclusive lock on a lock file. Released on drop.
pub struct FileLock {
    guard: sys::Guard,
    path: PathBuf,
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

impl FileLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock explicitly, surfacing unlock errors.
    pub fn release(self) -> io::Result<()> {
        sys::unlock(self.guard)
    }
}

/// Block until an exclusive lock on `path` is held.
///
/// The lock file is created (owner read/write only) if it does not exist.
/// Locks are process-scoped: a second acquire from another process waits
/// until the first holder releases or exits.
pub fn acquire_lock(path: &Path) -> io::Result<FileLock> {
    let file = open_lock_file(path)?;
    let guard = sys::lock_exclusive(file)?;
    Ok(FileLock { guard, path: path.to_path_buf() })
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.create(true).truncate(false).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path)
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;

    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};

    pub type Guard = Flock<File>;

    pub fn lock_exclusive(mut file: File) -> io::Result<Guard> {
        loop {
            match Flock::lock(file, FlockArg::LockExclusive) {
                Ok(guard) => return Ok(guard),
                Err((f, Errno::EINTR)) => file = f,
                Err((_, errno)) => return Err(io::Error::from(errno)),
            }
        }
    }

    pub fn unlock(guard: Guard) -> io::Result<()> {
        guard.unlock().map(drop).map_err(|(_, errno)| io::Error::from(errno))
    }
}

#[cfg(not(unix))]
mod sys {
    use std::fs::File;
    use std::io;

    pub struct Guard(File);

    impl Drop for Guard {
        fn drop(&mut self) {
            let _ = self.0.unlock();
        }
    }

    pub fn lock_exclusive(file: File) -> io::Result<Guard> {
        file.lock()?;
        Ok(Guard(file))
    }

    pub fn unlock(guard: Guard) -> io::Result<()> {
        guard.0.unlock()
    }
}
