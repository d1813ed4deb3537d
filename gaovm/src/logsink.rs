//! Rotating log sink.
//!
//! Appends level-tagged lines to a live file, rotating when a write would
//! push it past the size threshold: `.N` renames to `.N+1` (the oldest
//! generation is dropped), the live file becomes `.1`, and a fresh live file
//! is started. Rotation failures are best-effort by design. An internal
//! mutex serializes appends so concurrent writers never interleave bytes.
//!
//! The sink doubles as a `tracing_subscriber` writer, so daemon and driver
//! log lines land in the rotated files rather than stderr.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

use crate::util::now_ts;

/// Rotate when the live file would reach this size.
pub const ROTATE_BYTES: u64 = 10 * 1024 * 1024;

/// Rotated generations kept on disk (`.1` through `.3`).
pub const KEEP_GENERATIONS: u32 = 3;

struct Inner {
    path: PathBuf,
    file: File,
    size: u64,
    threshold: u64,
}

#[derive(Clone)]
pub struct LogSink {
    inner: Arc<Mutex<Inner>>,
}

impl LogSink {
    /// Open (or create) the live log file, creating parent directories.
    pub fn open(path: &Path) -> io::Result<LogSink> {
        LogSink::with_threshold(path, ROTATE_BYTES)
    }

    pub fn with_threshold(path: &Path, threshold: u64) -> io::Result<LogSink> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(LogSink {
            inner: Arc::new(Mutex::new(Inner {
                path: path.to_path_buf(),
                file,
                size,
                threshold,
            })),
        })
    }

    /// Append one level-tagged line, timestamped.
    pub fn append(&self, level: &str, message: &str) -> io::Result<()> {
        let line = format!("{} {:<5} {}\n", now_ts(), level, message);
        self.write_bytes(line.as_bytes()).map(|_| ())
    }

    fn write_bytes(&self, bytes: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.size + bytes.len() as u64 >= inner.threshold {
            inner.rotate()?;
        }
        inner.file.write_all(bytes)?;
        inner.size += bytes.len() as u64;
        Ok(bytes.len())
    }
}

impl Inner {
    fn generation_path(&self, n: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        // Shift generations, dropping the oldest. These renames are
        // best-effort; a failed shift must not lose the live log.
        let _ = std::fs::remove_file(self.generation_path(KEEP_GENERATIONS));
        for n in (1..KEEP_GENERATIONS).rev() {
            let _ = std::fs::rename(self.generation_path(n), self.generation_path(n + 1));
        }
        let _ = std::fs::rename(&self.path, self.generation_path(1));
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.size = 0;
        Ok(())
    }
}

/// A writer handle for `tracing_subscriber`. Each formatted event arrives as
/// one `write` call and is appended whole, so rotation boundaries fall
/// between lines.
pub struct SinkWriter {
    sink: LogSink,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.write_bytes(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let inner = self.sink.inner.lock().unwrap();
        (&inner.file).flush()
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> SinkWriter {
        SinkWriter { sink: self.clone() }
    }
}
