//! Atomic JSON and byte file writes.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::StorageError;

/// Serializes `value` as pretty JSON and atomically replaces `path`.
///
/// Parent directories are created when missing.
pub async fn write_json_atomic<T>(path: &Path, value: &T) -> Result<(), StorageError>
where
    T: Serialize + ?Sized,
{
    let data = serde_json::to_vec_pretty(value).map_err(|e| StorageError::json(path, e))?;
    write_bytes_atomic(path, &data).await
}

/// Atomically replaces `path` with `data` (write temp, fsync, rename).
///
/// Each call writes its own temp file, so concurrent writers to one path
/// never fail; the last rename wins.
pub async fn write_bytes_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
    }

    let temp_path = temp_path_for(path)?;

    if let Err(e) = write_and_sync(&temp_path, data).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::io(&temp_path, e));
    }

    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::io(path, e));
    }

    Ok(())
}

async fn write_and_sync(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

/// Reads and deserializes a JSON file.
///
/// Returns `Ok(None)` when the file does not exist.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let data = match fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(path, e)),
    };

    let value = serde_json::from_slice(&data).map_err(|e| StorageError::json(path, e))?;
    Ok(Some(value))
}

/// Computes the hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn temp_path_for(path: &Path) -> Result<PathBuf, StorageError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| StorageError::InvalidPath(path.display().to_string()))?;
    // Unique per write so concurrent writers never share a temp file.
    let mut temp_name = std::ffi::OsString::from(".");
    temp_name.push(file_name);
    temp_name.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    Ok(path.with_file_name(temp_name))
}
