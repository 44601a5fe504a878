//! Output sink and durable runtime state
//!
//! The JSON file sink maintains the cumulative output document (records plus a
//! metadata envelope, newest first). The state store persists everything that
//! must survive a restart besides the watermark: identity sessions and
//! per-member cooldown timestamps. All files are written via temp file +
//! atomic rename so a crash never leaves a partial write behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::Record;
use crate::pool::{EgressSnapshot, IdentitySnapshot};

/// Errors from sink and state persistence
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Receives newly observed records. Emission must complete before the
/// watermark for the same cycle is committed.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn emit(&self, records: &[Record]) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct OutputMeta {
    updated_at: DateTime<Utc>,
    record_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct OutputDocument {
    records: Vec<Record>,
    meta: OutputMeta,
}

/// Sink that maintains a single JSON document of all records seen, newest
/// first, deduplicated by id
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load_existing(&self) -> Vec<Record> {
        let Ok(file) = File::open(&self.path) else {
            return Vec::new();
        };
        match serde_json::from_reader::<_, OutputDocument>(BufReader::new(file)) {
            Ok(doc) => doc.records,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "output file unreadable, starting fresh");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Sink for JsonFileSink {
    async fn emit(&self, records: &[Record]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut merged = self.load_existing();
        merged.extend_from_slice(records);
        merged.sort_by(|a, b| b.id.cmp(&a.id));
        merged.dedup_by_key(|r| r.id);

        let document = OutputDocument {
            meta: OutputMeta {
                updated_at: Utc::now(),
                record_count: merged.len(),
            },
            records: merged,
        };

        write_atomic(&self.path, &document)?;
        debug!(
            new = records.len(),
            total = document.meta.record_count,
            path = %self.path.display(),
            "records emitted"
        );
        Ok(())
    }
}

/// Durable pool state saved after every release
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PoolState {
    pub identities: Vec<IdentitySnapshot>,
    pub egress: Vec<EgressSnapshot>,
}

/// File-backed store for pool state
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join("pool_state.json"),
        }
    }

    /// Read the saved pool state. Missing or unreadable files start fresh; a
    /// stale cooldown is better forgotten than a crash loop on corrupt state.
    pub fn load(&self) -> PoolState {
        let Ok(file) = File::open(&self.path) else {
            return PoolState::default();
        };
        match serde_json::from_reader(BufReader::new(file)) {
            Ok(state) => state,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "pool state unreadable, starting fresh");
                PoolState::default()
            }
        }
    }

    pub fn save(&self, state: &PoolState) -> Result<(), StoreError> {
        write_atomic(&self.path, state)
    }
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut temp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    temp_name.push(".tmp");
    let temp = path.with_file_name(temp_name);

    let file = File::create(&temp)?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)?;
    fs::rename(&temp, path)?;
    Ok(())
}
