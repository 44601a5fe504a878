// Core data structures for the talon watcher

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single normalized item from the watched list
///
/// Records carry a provider-assigned numeric id that is strictly increasing
/// over time; all dedup decisions compare these ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Provider item id, comparable and unique
    pub id: u64,
    /// Author handle as reported by the provider
    pub author: String,
    /// Item body text
    pub text: String,
    /// Provider-format creation timestamp, kept verbatim
    pub created_at: Option<String>,
    /// When this process captured the record
    pub captured_at: DateTime<Utc>,
}

impl Record {
    /// Create a record captured now
    pub fn new(id: u64, author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id,
            author: author.into(),
            text: text.into(),
            created_at: None,
            captured_at: Utc::now(),
        }
    }
}

/// Raw response pages collected during one poll
///
/// One page per load/scroll cycle, in fetch order. The renderer reports how
/// many scroll cycles ran so the scheduler can log truncated polls.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub pages: Vec<serde_json::Value>,
    pub scroll_cycles: u32,
}

impl RawPayload {
    pub fn empty() -> Self {
        Self {
            pages: Vec::new(),
            scroll_cycles: 0,
        }
    }
}

/// Classified result of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PollResult {
    /// Structurally valid response with at least one record
    DataFound,
    /// Structurally valid response, zero records, no rate-limit marker
    EmptyOk,
    /// Provider signalled a rate limit, explicitly or via marker rules
    RateLimited,
    /// Network/timeout/schema failure below the per-identity threshold
    TransientError,
    /// Unrecoverable auth failure or failures at/above threshold
    FatalError,
}

/// Outcome of one poll, fed back into the pools on release
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub result: PollResult,
    pub record_count: usize,
    pub raw_error: Option<String>,
}

impl PollOutcome {
    pub fn data_found(record_count: usize) -> Self {
        Self {
            result: PollResult::DataFound,
            record_count,
            raw_error: None,
        }
    }

    pub fn empty_ok() -> Self {
        Self {
            result: PollResult::EmptyOk,
            record_count: 0,
            raw_error: None,
        }
    }

    pub fn rate_limited(raw_error: Option<String>) -> Self {
        Self {
            result: PollResult::RateLimited,
            record_count: 0,
            raw_error,
        }
    }

    pub fn transient(raw_error: impl Into<String>) -> Self {
        Self {
            result: PollResult::TransientError,
            record_count: 0,
            raw_error: Some(raw_error.into()),
        }
    }

    pub fn fatal(raw_error: impl Into<String>) -> Self {
        Self {
            result: PollResult::FatalError,
            record_count: 0,
            raw_error: Some(raw_error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_constructors() {
        let found = PollOutcome::data_found(7);
        assert_eq!(found.result, PollResult::DataFound);
        assert_eq!(found.record_count, 7);
        assert!(found.raw_error.is_none());

        let limited = PollOutcome::rate_limited(Some("429".into()));
        assert_eq!(limited.result, PollResult::RateLimited);
        assert_eq!(limited.record_count, 0);
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let record = Record::new(105, "alice", "hello");
        let json = serde_json::to_string(&record).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
