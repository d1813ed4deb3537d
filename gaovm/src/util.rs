//! Miscellaneous utilities

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use nix::fcntl::{self, FlockArg};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another daemon already holds {0}")]
    AlreadyLocked(PathBuf),

    #[error("i/o error: {context}")]
    Io {
        context: String,
        #[source]
        error: std::io::Error,
    },

    #[error("system error: {context}")]
    System {
        context: String,
        #[source]
        error: nix::Error,
    },
}

/// RAII wrapper around an exclusive advisory lock on the daemon's lock file.
/// Holds the PID of the owning process. The lock is released and the file
/// removed (best-effort) when dropped.
///
/// See the `flock(2)` man page.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Take an exclusive non-blocking lock on `path`, then record our PID in
    /// it. Fails with [`LockError::AlreadyLocked`] when another process holds
    /// the lock.
    pub fn acquire(path: &Path) -> Result<LockFile, LockError> {
        // Do not truncate before the lock is held: the file may carry the
        // PID of a live daemon.
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|error| LockError::Io {
                context: format!("could not open lock file {}", path.display()),
                error,
            })?;

        match fcntl::flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(nix::errno::Errno::EWOULDBLOCK) => {
                return Err(LockError::AlreadyLocked(path.to_path_buf()))
            }
            Err(error) => {
                return Err(LockError::System {
                    context: format!("could not lock {}", path.display()),
                    error,
                })
            }
        }

        let mut file = file;
        file.set_len(0).map_err(|error| LockError::Io {
            context: format!("could not truncate {}", path.display()),
            error,
        })?;
        writeln!(file, "{}", std::process::id()).map_err(|error| LockError::Io {
            context: format!("could not write pid to {}", path.display()),
            error,
        })?;

        Ok(LockFile {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = fcntl::flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            tracing::warn!("unlocking {} failed: {}", self.path.display(), err);
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

/// ISO-8601 timestamp with millisecond precision, used on events, ping
/// replies and persisted records.
pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
