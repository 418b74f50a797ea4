//! Single-instance guard (C9).
//!
//! `<configDir>/moleport.pid`, mode `0600`, held for the process lifetime
//! behind an exclusive non-blocking advisory file lock via `fs2` (the
//! crate `wizardsardine-liana` and `unicity-astrid-astrid` both reach for
//! the same job). The lock, not the liveness probe, is the true
//! mutual-exclusion mechanism -- PIDs can be recycled by the OS.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidLockError {
    #[error("another instance is already running (pid file: {0})")]
    AlreadyRunning(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Holds the open, locked pid file for the process lifetime. Dropping (or
/// calling `release`) removes the file and unlocks it; both are idempotent.
pub struct PidLock {
    path: PathBuf,
    file: Option<File>,
}

impl PidLock {
    /// Acquire the lock, truncate the file, and write the current PID
    /// followed by a newline. Fails with `AlreadyRunning` if another
    /// process already holds the lock.
    pub fn acquire(path: &Path) -> Result<Self, PidLockError> {
        #[cfg(unix)]
        let mut file = {
            use std::os::unix::fs::OpenOptionsExt;
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .mode(0o600)
                .open(path)?
        };
        #[cfg(not(unix))]
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(PidLockError::AlreadyRunning(path.to_path_buf()));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(PidLock {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    /// Release the lock, unlock, close, and remove the pid file.
    /// Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
            drop(file);
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Read the pid file at `path` and probe whether that process still
/// exists (signal 0). Returns `false` on any parse/read failure or if the
/// process is gone. Note this is a best-effort hint, not the mutual
/// exclusion mechanism -- PIDs can be recycled.
pub fn is_running(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut contents = String::new();
    if file.read_to_string(&mut contents).is_err() {
        return false;
    }
    let Ok(pid) = contents.trim().parse::<i32>() else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    #[cfg(unix)]
    {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        false
    }
}
