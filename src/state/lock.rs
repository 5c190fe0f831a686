//! Run Lock
//!
//! The engine assumes a single instance per table set. `tiersync run` takes
//! an exclusive advisory `flock` on a lock file for the duration of the cycle
//! so that overlapping cron invocations back off instead of racing on the
//! watermark map. The kernel drops the lock when the process exits, so a
//! killed run never leaves a stale lock behind.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};

use crate::error::{Error, Result};

/// Held exclusive lock; released on drop
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Try to take the lock without blocking
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(Errno::EWOULDBLOCK) => {
                return Err(Error::Locked(path.display().to_string()));
            }
            Err(e) => {
                return Err(Error::State(format!(
                    "Failed to lock {}: {}",
                    path.display(),
                    e
                )));
            }
        }

        // Owner pid for whoever inspects the file
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Lock file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}
