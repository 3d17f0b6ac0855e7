//! Blob backends for the progress store.
//!
//! The store keeps its whole mapping as one serialized blob under a single
//! key, so a backend only needs to read and replace whole values.

use crate::{NarratorError, Result};
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

pub trait BlobBackend: Send + Sync {
    /// Read the blob stored under `key`; `None` when it was never written
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the blob under `key` in one step
    fn write(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// One JSON file per key inside a directory.
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// crash mid-write never leaves a truncated store behind.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl BlobBackend for FileBackend {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(NarratorError::PersistenceError(format!(
                "read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let tmp = self.dir.join(format!(".{}.json.tmp", key));
        let persist = || -> std::io::Result<()> {
            std::fs::create_dir_all(&self.dir)?;
            std::fs::write(&tmp, value)?;
            std::fs::rename(&tmp, &path)
        };
        persist().map_err(|e| {
            NarratorError::PersistenceError(format!("write {}: {}", path.display(), e))
        })?;
        debug!(target = "progress", path = ?path, bytes = value.len(), "Blob written");
        Ok(())
    }
}

/// Process-local backend for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryBackend {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobBackend for MemoryBackend {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(key).map(|v| v.value().clone()))
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.blobs.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// RocksDB-backed persistence
#[cfg(feature = "rocksdb")]
pub struct RocksDbBackend {
    db: rocksdb::DB,
}

#[cfg(feature = "rocksdb")]
impl RocksDbBackend {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);

        let db = rocksdb::DB::open(&opts, path)
            .map_err(|e| NarratorError::PersistenceError(e.to_string()))?;

        tracing::info!(target = "progress", "RocksDB progress backend initialized");
        Ok(Self { db })
    }
}

#[cfg(feature = "rocksdb")]
impl BlobBackend for RocksDbBackend {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map_err(|e| NarratorError::PersistenceError(e.to_string()))
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db
            .put(key, value)
            .map_err(|e| NarratorError::PersistenceError(e.to_string()))
    }
}
