//! JSON blob store for cluster snapshots.
//!
//! Each key maps to one file under the store directory. Writes land in a
//! temporary sibling first and are renamed into place, so readers only ever
//! see a complete document.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Latest machine snapshot list.
pub const MACHINE_SNAPSHOT: &str = "machine-info.json";
/// Latest container snapshot list.
pub const CONTAINER_SNAPSHOT: &str = "container-info.json";
/// Latest aggregated overview.
pub const OVERVIEW_SNAPSHOT: &str = "overview.json";

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot {key}: io error: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot {key}: invalid document: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Directory-backed key/value store of JSON documents.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| SnapshotError::Io {
                key: dir.display().to_string(),
                source,
            })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Serializes `value` and atomically replaces the document at `key`.
    pub async fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), SnapshotError> {
        let json = serde_json::to_vec_pretty(value).map_err(|source| SnapshotError::Json {
            key: key.to_string(),
            source,
        })?;
        let target = self.dir.join(key);
        let staging = self.dir.join(format!(".{key}.tmp"));
        let io_err = |source| SnapshotError::Io {
            key: key.to_string(),
            source,
        };
        tokio::fs::write(&staging, &json).await.map_err(io_err)?;
        tokio::fs::rename(&staging, &target).await.map_err(io_err)?;
        Ok(())
    }

    /// Reads the document at `key`. A missing document is `Ok(None)`.
    pub async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SnapshotError> {
        let bytes = match tokio::fs::read(self.dir.join(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SnapshotError::Io {
                    key: key.to_string(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| SnapshotError::Json {
                key: key.to_string(),
                source,
            })
    }

    /// Raw bytes of the document at `key`, if present.
    pub async fn read_raw(&self, key: &str) -> Option<Vec<u8>> {
        tokio::fs::read(self.dir.join(key)).await.ok()
    }
}
