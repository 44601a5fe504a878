//! Response normalization for the provider's nested timeline schema
//!
//! The provider wraps list items several layers deep:
//! `data.list.tweets_timeline.timeline.instructions[].entries[]`. Each entry
//! is classified into a tagged variant over the known kinds; anything
//! unrecognized is ignored rather than probed at runtime. Normalization is
//! pure and deterministic for identical input.

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

use crate::models::{RawPayload, Record};

/// Errors from payload normalization
#[derive(Error, Debug)]
pub enum NormalizeError {
    /// The payload does not expose the expected timeline structure at all
    #[error("unrecognized payload shape: {0}")]
    Schema(String),
}

/// Turns a raw payload into ordered records
pub trait ResponseNormalizer: Send + Sync {
    fn normalize(&self, payload: &RawPayload) -> Result<Vec<Record>, NormalizeError>;
}

/// One entry of the provider timeline, tagged by kind
#[derive(Debug, Clone, PartialEq, Eq)]
enum TimelineEntry {
    /// A list item with the fields we extract
    Item(Record),
    /// A pagination cursor; consumed by the renderer, ignored here
    Cursor,
    /// Any entry kind this version does not understand
    Unknown,
}

/// Normalizer for the provider's list timeline responses
#[derive(Debug, Default)]
pub struct TimelineNormalizer;

impl TimelineNormalizer {
    pub fn new() -> Self {
        Self
    }

    fn classify_entry(entry: &Value) -> TimelineEntry {
        let Some(entry_id) = entry.get("entryId").and_then(Value::as_str) else {
            return TimelineEntry::Unknown;
        };

        if entry_id.starts_with("cursor-") {
            return TimelineEntry::Cursor;
        }
        if !entry_id.starts_with("tweet-") {
            return TimelineEntry::Unknown;
        }

        let Some(item) = entry
            .pointer("/content/itemContent/tweet_results/result")
        else {
            return TimelineEntry::Unknown;
        };

        let Some(id) = item
            .get("rest_id")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse::<u64>().ok())
        else {
            return TimelineEntry::Unknown;
        };
        let Some(text) = item.pointer("/legacy/full_text").and_then(Value::as_str) else {
            return TimelineEntry::Unknown;
        };

        let author = item
            .pointer("/core/user_results/result/legacy/screen_name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let created_at = item
            .pointer("/legacy/created_at")
            .and_then(Value::as_str)
            .map(str::to_string);

        TimelineEntry::Item(Record {
            id,
            author,
            text: text.to_string(),
            created_at,
            captured_at: Utc::now(),
        })
    }

    fn instructions(page: &Value) -> Result<&Vec<Value>, NormalizeError> {
        page.pointer("/data/list/tweets_timeline/timeline/instructions")
            .and_then(Value::as_array)
            .ok_or_else(|| NormalizeError::Schema("timeline instructions missing".into()))
    }
}

impl ResponseNormalizer for TimelineNormalizer {
    fn normalize(&self, payload: &RawPayload) -> Result<Vec<Record>, NormalizeError> {
        let mut records = Vec::new();

        for page in &payload.pages {
            for instruction in Self::instructions(page)? {
                let Some(entries) = instruction.get("entries").and_then(Value::as_array) else {
                    // Instructions without entries (pin, clear-cache) are legal
                    continue;
                };
                for entry in entries {
                    match Self::classify_entry(entry) {
                        TimelineEntry::Item(record) => records.push(record),
                        TimelineEntry::Cursor => {}
                        TimelineEntry::Unknown => {
                            trace!(entry = ?entry.get("entryId"), "ignoring unknown timeline entry");
                        }
                    }
                }
            }
        }

        Ok(records)
    }
}
