//! Progress store: last position and completion percentage per book.
//!
//! The whole mapping `book id -> record` lives in one JSON blob under
//! [`PROGRESS_KEY`]. Every save is a single read-modify-write of that blob.
//! The store has no rate limiting of its own; the narration engine debounces
//! its saves.

mod backend;

pub use backend::{BlobBackend, FileBackend, MemoryBackend};

#[cfg(feature = "rocksdb")]
pub use backend::RocksDbBackend;

use crate::book::Position;
use crate::{NarratorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Well-known key of the serialized store
pub const PROGRESS_KEY: &str = "narrator_progress";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub chapter: usize,
    pub paragraph: usize,
    #[serde(default)]
    pub percentage: f64,
    /// Milliseconds since the UNIX epoch
    pub timestamp: i64,
}

impl ProgressRecord {
    pub fn position(&self) -> Position {
        Position::new(self.chapter, self.paragraph)
    }
}

pub type ProgressSnapshot = BTreeMap<String, ProgressRecord>;

/// File name for an exported backup taken on `date`
pub fn backup_file_name(date: chrono::NaiveDate) -> String {
    format!("narrator-backup-{}.json", date.format("%Y-%m-%d"))
}

pub struct ProgressStore {
    backend: Arc<dyn BlobBackend>,
    key: String,
    // serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl ProgressStore {
    pub fn new(backend: Arc<dyn BlobBackend>) -> Self {
        Self::with_key(backend, PROGRESS_KEY)
    }

    pub fn with_key(backend: Arc<dyn BlobBackend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    fn read_snapshot(&self) -> Result<ProgressSnapshot> {
        match self.backend.read(&self.key)? {
            Some(data) => serde_json::from_slice(&data).map_err(|e| {
                NarratorError::PersistenceError(format!("corrupt progress store: {}", e))
            }),
            None => Ok(ProgressSnapshot::new()),
        }
    }

    fn write_snapshot(&self, snapshot: &ProgressSnapshot) -> Result<()> {
        let data = serde_json::to_vec(snapshot)?;
        self.backend.write(&self.key, &data)
    }

    /// Merge a record for `book_id`, stamped with the current time.
    pub fn save(&self, book_id: &str, position: Position, percentage: f64) -> Result<ProgressRecord> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| NarratorError::PersistenceError("progress lock poisoned".into()))?;

        let mut snapshot = self.read_snapshot()?;
        let record = ProgressRecord {
            chapter: position.chapter,
            paragraph: position.paragraph,
            percentage: if percentage.is_finite() {
                percentage.clamp(0.0, 100.0)
            } else {
                0.0
            },
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        snapshot.insert(book_id.to_string(), record.clone());
        self.write_snapshot(&snapshot)?;

        debug!(
            target = "progress",
            book = book_id,
            position = %position,
            percentage = record.percentage,
            "Progress saved"
        );
        Ok(record)
    }

    /// Stored record for `book_id`; `None` on a first-ever open.
    pub fn load(&self, book_id: &str) -> Result<Option<ProgressRecord>> {
        Ok(self.read_snapshot()?.remove(book_id))
    }

    /// Every record, e.g. to show per-book percentages in a library view
    pub fn all(&self) -> Result<ProgressSnapshot> {
        self.read_snapshot()
    }

    /// The stored blob verbatim, `{}` when nothing was saved yet
    pub fn export_all(&self) -> Result<String> {
        match self.backend.read(&self.key)? {
            Some(data) => String::from_utf8(data).map_err(|e| {
                NarratorError::PersistenceError(format!("progress store is not UTF-8: {}", e))
            }),
            None => Ok("{}".to_string()),
        }
    }

    /// Replace the whole store with `snapshot`.
    ///
    /// The input is fully validated first; on any validation failure the
    /// existing store is left untouched. Returns the number of records.
    pub fn import_all(&self, snapshot: &str) -> Result<usize> {
        let parsed = match validate_snapshot(snapshot) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(target = "progress", error = %e, "Rejected progress import");
                return Err(e);
            }
        };

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| NarratorError::PersistenceError("progress lock poisoned".into()))?;
        self.write_snapshot(&parsed)?;

        info!(target = "progress", records = parsed.len(), "Progress store restored");
        Ok(parsed.len())
    }
}

fn validate_snapshot(input: &str) -> Result<ProgressSnapshot> {
    let value: serde_json::Value = serde_json::from_str(input)
        .map_err(|e| NarratorError::ImportValidationError(format!("not valid JSON: {}", e)))?;

    let map = match value {
        serde_json::Value::Object(map) => map,
        other => {
            return Err(NarratorError::ImportValidationError(format!(
                "expected a mapping of book ids, got {}",
                json_kind(&other)
            )))
        }
    };

    let mut snapshot = ProgressSnapshot::new();
    for (book_id, raw) in map {
        let record: ProgressRecord = serde_json::from_value(raw).map_err(|e| {
            NarratorError::ImportValidationError(format!("record {:?}: {}", book_id, e))
        })?;
        if !record.percentage.is_finite() || !(0.0..=100.0).contains(&record.percentage) {
            return Err(NarratorError::ImportValidationError(format!(
                "record {:?}: percentage {} out of range",
                book_id, record.percentage
            )));
        }
        snapshot.insert(book_id, record);
    }
    Ok(snapshot)
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
