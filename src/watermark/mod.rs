//! Watermark-based incremental deduplication
//!
//! The watermark is the highest item id ever observed. Each poll's batch is
//! filtered down to ids strictly above it; the candidate watermark is the
//! maximum id over the whole batch, so an out-of-order batch whose newest id
//! is not first still advances correctly. The durable store commits the
//! watermark only after the filtered records have been handed to the sink,
//! so a crash can at most re-deliver, never silently drop.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::models::Record;

/// Result of filtering one batch against the watermark
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filtered {
    /// Strictly-newer records, newest first
    pub fresh: Vec<Record>,
    /// Maximum id over the entire unfiltered batch, `None` for an empty batch
    pub candidate: Option<u64>,
}

/// Filter a batch down to records strictly newer than the watermark.
///
/// The source payload is external and only semi-trusted: its stated ordering
/// is not assumed, so the batch is re-sorted by id descending and deduplicated
/// by id before the cut. Relative order among surviving records is therefore
/// newest-first regardless of input order. Idempotent: re-filtering against
/// the candidate yields nothing.
pub fn filter(batch: Vec<Record>, watermark: Option<u64>) -> Filtered {
    if batch.is_empty() {
        return Filtered {
            fresh: Vec::new(),
            candidate: None,
        };
    }

    let mut sorted = batch;
    sorted.sort_by(|a, b| b.id.cmp(&a.id));
    sorted.dedup_by_key(|r| r.id);

    // Descending order puts the maximum first
    let candidate = sorted.first().map(|r| r.id);

    let fresh = match watermark {
        None => sorted,
        Some(mark) => sorted.into_iter().filter(|r| r.id > mark).collect(),
    };

    Filtered { fresh, candidate }
}

/// Errors from the durable watermark store
#[derive(Error, Debug)]
pub enum WatermarkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt watermark file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkFile {
    watermark: u64,
    committed_at: chrono::DateTime<chrono::Utc>,
}

/// File-backed watermark, written atomically via temp file + rename
pub struct WatermarkStore {
    path: PathBuf,
}

impl WatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the last committed watermark. A missing file means a first run.
    pub fn load(&self) -> Result<Option<u64>, WatermarkError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let file = File::open(&self.path)?;
        let parsed: WatermarkFile = serde_json::from_reader(BufReader::new(file))?;
        Ok(Some(parsed.watermark))
    }

    /// Durably commit a new watermark. Callers must emit the batch first;
    /// commit is the last step of a cycle.
    pub fn commit(&self, watermark: u64) -> Result<(), WatermarkError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp = temp_path(&self.path);
        let file = File::create(&temp)?;
        serde_json::to_writer_pretty(
            BufWriter::new(file),
            &WatermarkFile {
                watermark,
                committed_at: chrono::Utc::now(),
            },
        )?;
        fs::rename(&temp, &self.path)?;

        debug!(watermark, path = %self.path.display(), "watermark committed");
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
