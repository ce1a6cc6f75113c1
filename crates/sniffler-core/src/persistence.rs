//! Event & persistence pipeline, directory-based half (§4.4).
//!
//! All files are JSON with a `{version, lastUpdated, ...}` envelope.
//! Readers accept a legacy bare-array form and upgrade it in memory.
//! Corrupt files are renamed to `*.backup-<epoch-ms>` and the caller starts
//! fresh. Writes are idempotent overwrites, serialized per file by a
//! per-path mutex so concurrent callers never interleave.

use crate::model::now_millis;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const CURRENT_VERSION: &str = "1.0";

/// Versioned envelope wrapping a collection of records.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Envelope<T> {
    /// Schema version. Always `"1.0"` for files written by this
    /// implementation.
    pub version: String,
    /// Epoch-millis timestamp of the last write.
    #[serde(rename = "lastUpdated")]
    pub last_updated: u64,
    /// The wrapped records.
    pub items: Vec<T>,
}

impl<T> Envelope<T> {
    /// Wrap `items` in a fresh envelope stamped with the current time.
    pub fn new(items: Vec<T>) -> Self {
        Self {
            version: CURRENT_VERSION.to_string(),
            last_updated: now_millis(),
            items,
        }
    }
}

/// Directory-based JSON store rooted at an OS-appropriate user data
/// directory, serializing writes per path.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
    write_locks: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl Store {
    /// Open a store rooted at `<data_root>/sniffler-data`.
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            root: data_root.into().join("sniffler-data"),
            write_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Resolve the OS-appropriate default user data root (consumed from the
    /// host per §6; falls back to the current directory if undiscoverable).
    pub fn default_root() -> PathBuf {
        dirs::data_dir().unwrap_or_else(|| PathBuf::from("."))
    }

    /// Absolute path for a file relative to the store root
    /// (e.g. `"mocks/mocks-5432.json"`).
    pub fn path_for(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    async fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Read the envelope at `relative`, upgrading a legacy bare-array form
    /// in memory, or quarantining the file and returning an empty list if
    /// it's corrupt. A missing file also returns an empty list.
    pub async fn read<T>(&self, relative: &str) -> crate::Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let path = self.path_for(relative);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(crate::Error::persistence(format!("reading {}: {err}", path.display()))),
        };

        if let Ok(envelope) = serde_json::from_slice::<Envelope<T>>(&bytes) {
            return Ok(envelope.items);
        }
        if let Ok(items) = serde_json::from_slice::<Vec<T>>(&bytes) {
            return Ok(items);
        }

        self.quarantine(&path).await?;
        Ok(Vec::new())
    }

    /// Overwrite `relative` with a freshly stamped envelope around `items`.
    pub async fn write<T>(&self, relative: &str, items: &[T]) -> crate::Result<()>
    where
        T: Serialize,
    {
        let path = self.path_for(relative);
        let lock = self.lock_for(&path).await;
        let _guard = lock.lock().await;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| crate::Error::persistence(format!("creating {}: {e}", parent.display())))?;
        }
        let envelope = Envelope::new(items.iter().collect::<Vec<_>>());
        let json = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| crate::Error::persistence(format!("encoding {}: {e}", path.display())))?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| crate::Error::persistence(format!("writing {}: {e}", path.display())))?;
        Ok(())
    }

    async fn quarantine(&self, path: &Path) -> crate::Result<()> {
        let backup = path.with_extension(format!("json.backup-{}", now_millis()));
        match tokio::fs::rename(path, &backup).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(crate::Error::persistence(format!(
                "quarantining corrupt file {}: {err}",
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, serde::Deserialize, PartialEq)]
    struct Rec {
        id: u32,
    }

    #[tokio::test]
    async fn round_trips_through_envelope() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        store.write("proxies.json", &[Rec { id: 1 }, Rec { id: 2 }]).await.unwrap();
        let read_back: Vec<Rec> = store.read("proxies.json").await.unwrap();
        assert_eq!(read_back, vec![Rec { id: 1 }, Rec { id: 2 }]);
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let read_back: Vec<Rec> = store.read("nope.json").await.unwrap();
        assert!(read_back.is_empty());
    }

    #[tokio::test]
    async fn legacy_bare_array_is_upgraded_in_memory() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let path = store.path_for("proxies.json");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, r#"[{"id":7}]"#).await.unwrap();
        let read_back: Vec<Rec> = store.read("proxies.json").await.unwrap();
        assert_eq!(read_back, vec![Rec { id: 7 }]);
    }

    #[tokio::test]
    async fn corrupt_file_is_quarantined_and_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let path = store.path_for("proxies.json");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, "{{").await.unwrap();

        let read_back: Vec<Rec> = store.read("proxies.json").await.unwrap();
        assert!(read_back.is_empty());
        assert!(!path.exists());

        let mut entries = tokio::fs::read_dir(path.parent().unwrap()).await.unwrap();
        let mut found_backup = false;
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.file_name().to_string_lossy().contains("backup-") {
                found_backup = true;
            }
        }
        assert!(found_backup);
    }
}
