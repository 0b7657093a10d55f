//! Durable append-only line log.
//!
//! Every `write` is one self-contained append: the file is opened in append
//! mode, locked with `flock(LOCK_EX)`, written, unlocked and closed. An
//! in-process mutex serializes threads of one process before they reach the
//! OS lock, and the OS lock serializes separate processes sharing the path.
//! No handle is kept open between calls.

use chrono::{DateTime, Local, SecondsFormat};
use std::fmt::Display;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, trace};

/// Append log errors.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to resolve log path '{}': {source}", .path.display())]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create log directory '{}': {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open log file '{}': {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to lock log file '{}': {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to append to log file '{}': {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Options for a single `AppendLog::write`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Prefix the line with `[<RFC 3339 local time>] `.
    pub timestamp: bool,
}

/// Exclusive `flock` held on a file descriptor, released on drop.
struct FlockGuard {
    fd: RawFd,
}

impl FlockGuard {
    fn exclusive(fd: RawFd) -> io::Result<Self> {
        loop {
            // SAFETY: `fd` belongs to a `File` that outlives this guard.
            let rc = unsafe { libc::flock(fd, libc::LOCK_EX) };
            if rc == 0 {
                return Ok(Self { fd });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for FlockGuard {
    fn drop(&mut self) {
        // SAFETY: see `exclusive`. Closing the file would release it anyway.
        unsafe {
            libc::flock(self.fd, libc::LOCK_UN);
        }
    }
}

/// Line logger safe to share across threads and processes.
#[derive(Debug)]
pub struct AppendLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AppendLog {
    /// Create a logger for `path`, creating missing parent directories.
    ///
    /// Relative paths are resolved against the current directory.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref();
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|source| LogError::Resolve {
                    path: path.to_path_buf(),
                    source,
                })?
                .join(path)
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| LogError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        debug!(path = %path.display(), "Append log ready");
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Absolute path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `message` as one complete line.
    pub fn write(&self, message: impl Display, options: WriteOptions) -> Result<(), LogError> {
        let timestamp = options.timestamp.then(Local::now);
        let line = build_line(&message.to_string(), timestamp);

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| LogError::Open {
                path: self.path.clone(),
                source,
            })?;

        let _flock = FlockGuard::exclusive(file.as_raw_fd()).map_err(|source| LogError::Lock {
            path: self.path.clone(),
            source,
        })?;

        file.write_all(line.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|source| LogError::Write {
                path: self.path.clone(),
                source,
            })?;

        trace!(bytes = line.len(), "Appended line");
        Ok(())
    }

    /// Append `message` without a timestamp.
    pub fn write_line(&self, message: impl Display) -> Result<(), LogError> {
        self.write(message, WriteOptions::default())
    }

    /// No-op: every `write` already reaches the file before returning.
    pub fn flush(&self) -> Result<(), LogError> {
        Ok(())
    }
}

/// Format one log line: optional timestamp prefix, exactly one trailing `\n`.
fn build_line(message: &str, timestamp: Option<DateTime<Local>>) -> String {
    let mut line = match timestamp {
        Some(now) => format!(
            "[{}] {message}",
            now.to_rfc3339_opts(SecondsFormat::Secs, false)
        ),
        None => message.to_string(),
    };
    if !line.ends_with('\n') {
        line.push('\n');
    }
    line
}
