//! Atomic JSON file operations.
//!
//! Provides a thin layer for safe access to JSON records on disk.

use parley_core::{ParleyError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;

/// Process-wide sequence for tmp sibling names. Each save writes its own
/// tmp file, so two tasks saving the same target never collide on the
/// tmp path; both renames land a complete record, last one wins.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// A handle to a JSON file written atomically.
///
/// Provides:
/// - **Atomicity**: Updates are all-or-nothing via tmp file + atomic rename
/// - **Consistency**: Schema validation on load
/// - **Durability**: Explicit fsync before rename
///
/// The tmp sibling lives in the same directory as the target, so the
/// rename never crosses a filesystem boundary.
pub struct AtomicJsonFile<T> {
    path: PathBuf,
    _phantom: PhantomData<T>,
}

impl<T> AtomicJsonFile<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Creates a new atomic JSON file handle.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            _phantom: PhantomData,
        }
    }

    /// The path this handle reads and writes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the file and deserializes it.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(T))`: Successfully loaded and deserialized
    /// - `Ok(None)`: File doesn't exist or is empty
    /// - `Err(StorageCorruption)`: File exists but cannot be parsed
    pub async fn load(&self) -> Result<Option<T>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            ParleyError::corruption(self.path.display().to_string(), e.to_string())
        })
    }

    /// Saves data to the file atomically.
    ///
    /// Writes a tmp sibling, fsyncs it, then renames it over the target.
    /// A crash mid-write leaves either the old record or the new one,
    /// never a truncated file.
    pub async fn save(&self, data: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(data)?;

        let tmp_path = self.temp_path()?;
        let mut tmp_file = tokio::fs::File::create(&tmp_path).await?;
        tmp_file.write_all(&json).await?;
        tmp_file.sync_all().await?;
        drop(tmp_file);

        tokio::fs::rename(&tmp_path, &self.path).await?;

        Ok(())
    }

    /// Removes the file; returns whether it existed.
    pub async fn remove(&self) -> Result<bool> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes leftover tmp siblings from interrupted writes. Best effort.
    pub async fn remove_temp_artifacts(&self) {
        let (Some(parent), Some(file_name)) = (self.path.parent(), self.path.file_name()) else {
            return;
        };
        let prefix = format!("{}.", file_name.to_string_lossy());
        let Ok(mut read_dir) = tokio::fs::read_dir(parent).await else {
            return;
        };
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(".tmp") {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }

    fn temp_path(&self) -> Result<PathBuf> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| ParleyError::io("Path has no parent directory"))?;
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| ParleyError::io("Path has no file name"))?;
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        Ok(parent.join(format!("{}.{}.tmp", file_name.to_string_lossy(), seq)))
    }
}
