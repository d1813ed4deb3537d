//! Atomic JSON persistence.
//!
//! All on-disk state goes through [`write_json_atomic`]: the serialized
//! document is written to a uniquely named sibling temp file, flushed, then
//! renamed over the target. Readers therefore observe either the prior
//! committed bytes or the new complete bytes, never a truncated prefix. The
//! parent directory is fsynced after the rename where the platform allows
//! it; that step is best-effort.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("i/o error: {context}")]
    Io {
        context: String,
        #[source]
        error: std::io::Error,
    },

    #[error("invalid JSON in {path}: {error}")]
    Json {
        path: String,
        #[source]
        error: serde_json::Error,
    },
}

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> PersistError {
    let context = context.into();
    move |error| PersistError::Io { context, error }
}

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write `value` to `target` atomically, pretty-printed.
pub async fn write_json_atomic<T: Serialize>(target: &Path, value: &T) -> Result<(), PersistError> {
    let payload = serde_json::to_vec_pretty(value).map_err(|error| PersistError::Json {
        path: target.display().to_string(),
        error,
    })?;

    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_owned());
    name.push_str(&format!(".tmp.{}.{}", std::process::id(), seq));
    let temp = target.with_file_name(name);

    let mut file = tokio::fs::File::create(&temp)
        .await
        .map_err(io_err(format!("could not create {}", temp.display())))?;
    let write_result = async {
        file.write_all(&payload).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    if let Err(error) = write_result {
        drop(file);
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(io_err(format!("could not write {}", temp.display()))(error));
    }
    drop(file);

    if let Err(error) = tokio::fs::rename(&temp, target).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(io_err(format!(
            "could not rename {} over {}",
            temp.display(),
            target.display()
        ))(error));
    }

    // Make the rename durable. Failure here is non-fatal: the data itself is
    // already committed.
    if let Some(parent) = target.parent() {
        if let Ok(dir) = tokio::fs::File::open(parent).await {
            let _ = dir.sync_all().await;
        }
    }

    Ok(())
}

/// Read and deserialize `path`. Returns `Ok(None)` when the file is absent.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(io_err(format!("could not read {}", path.display()))(error)),
    };
    let value = serde_json::from_slice(&bytes).map_err(|error| PersistError::Json {
        path: path.display().to_string(),
        error,
    })?;
    Ok(Some(value))
}
