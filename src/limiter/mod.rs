//! Rate-limit detection and cooldown policy
//!
//! The classifier maps a poll's raw outcome onto the [`PollResult`] taxonomy;
//! the cooldown policy turns a classified result into a pool action. Telling
//! "quiet list" apart from "actively blocked" relies on provider-specific
//! markers, so the marker rules are configurable regex patterns rather than
//! hard-coded constants. A quiet list still earns a short cooldown: there is
//! no point hammering an empty timeline, and spreading the idle checks across
//! identities keeps every session warm.

use regex::{Regex, RegexSet};
use std::time::Duration;

use crate::models::{PollOutcome, PollResult};
use crate::parser::NormalizeError;
use crate::renderer::FetchError;

/// Default marker patterns for the provider's rate-limit phrasing
const DEFAULT_MARKERS: &[&str] = &[
    r"(?i)rate limit",
    r"(?i)too many requests",
    r"\b429\b",
];

/// Raw material for classification: what the fetch and normalize steps
/// produced for one poll
#[derive(Debug)]
pub enum CycleOutcome<'a> {
    /// Fetch and normalize both succeeded
    Fetched {
        record_count: usize,
        /// Raw body text the marker rules run against
        body: Option<&'a str>,
    },
    /// The renderer call failed
    FetchFailed(&'a FetchError),
    /// Fetch succeeded but the payload did not match the known schema
    NormalizeFailed {
        error: &'a NormalizeError,
        body: Option<&'a str>,
    },
}

/// Classifies poll outcomes using configurable marker rules
pub struct Classifier {
    markers: RegexSet,
    /// Consecutive network failures at/above this count become fatal
    failure_threshold: u32,
}

impl Classifier {
    /// Build a classifier from marker patterns. An empty slice selects the
    /// built-in defaults.
    pub fn new(patterns: &[String], failure_threshold: u32) -> Result<Self, regex::Error> {
        let markers = if patterns.is_empty() {
            RegexSet::new(DEFAULT_MARKERS)?
        } else {
            // Validate each pattern individually for a precise error message
            for pattern in patterns {
                Regex::new(pattern)?;
            }
            RegexSet::new(patterns)?
        };

        Ok(Self {
            markers,
            failure_threshold: failure_threshold.max(1),
        })
    }

    pub fn with_defaults(failure_threshold: u32) -> Self {
        Self {
            markers: RegexSet::new(DEFAULT_MARKERS).expect("built-in marker patterns are valid"),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Classify one poll. `consecutive_failures` is the identity's failure
    /// streak before this poll; the streak including this failure is compared
    /// against the threshold.
    pub fn classify(&self, outcome: CycleOutcome<'_>, consecutive_failures: u32) -> PollOutcome {
        match outcome {
            CycleOutcome::Fetched { record_count, body } => {
                if record_count > 0 {
                    PollOutcome::data_found(record_count)
                } else if body.is_some_and(|text| self.markers.is_match(text)) {
                    PollOutcome::rate_limited(Some("rate-limit marker in payload".into()))
                } else {
                    PollOutcome::empty_ok()
                }
            }
            CycleOutcome::FetchFailed(err) => self.classify_fetch_error(err, consecutive_failures),
            CycleOutcome::NormalizeFailed { error, body } => {
                if body.is_some_and(|text| self.markers.is_match(text)) {
                    PollOutcome::rate_limited(Some(error.to_string()))
                } else {
                    // Schema drift must never crash the loop and never retire
                    // an identity; skip this cycle and retry on schedule.
                    PollOutcome::transient(error.to_string())
                }
            }
        }
    }

    fn classify_fetch_error(&self, err: &FetchError, consecutive_failures: u32) -> PollOutcome {
        match err {
            FetchError::RateLimited(detail) => {
                PollOutcome::rate_limited(Some(detail.clone()))
            }
            FetchError::AuthExpired => PollOutcome::fatal(err.to_string()),
            _ if self.markers.is_match(&err.to_string()) => {
                PollOutcome::rate_limited(Some(err.to_string()))
            }
            _ => {
                if consecutive_failures + 1 >= self.failure_threshold {
                    PollOutcome::fatal(err.to_string())
                } else {
                    PollOutcome::transient(err.to_string())
                }
            }
        }
    }
}

/// What the pool should do with a member after an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownAction {
    /// Immediately eligible again
    Available,
    /// Out of rotation for the given duration
    CoolFor(Duration),
    /// Out of rotation until external intervention
    Retire,
}

/// Cooldown durations applied on release
#[derive(Debug, Clone)]
pub struct CooldownPolicy {
    /// Applied on an explicit rate limit
    pub rate_limited: Duration,
    /// Applied when the list was quiet; spreads load across identities
    pub quiet: Duration,
    /// First transient failure cools for this long, doubling per consecutive
    /// failure
    pub transient_base: Duration,
    /// Ceiling on the transient backoff
    pub transient_cap: Duration,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            rate_limited: Duration::from_secs(600),
            quiet: Duration::from_secs(300),
            transient_base: Duration::from_secs(30),
            transient_cap: Duration::from_secs(480),
        }
    }
}

impl CooldownPolicy {
    /// Map a classified result onto a pool action. `consecutive_failures` is
    /// the streak including the failure being released.
    pub fn action_for(&self, result: PollResult, consecutive_failures: u32) -> CooldownAction {
        match result {
            PollResult::DataFound => CooldownAction::Available,
            PollResult::EmptyOk => CooldownAction::CoolFor(self.quiet),
            PollResult::RateLimited => CooldownAction::CoolFor(self.rate_limited),
            PollResult::TransientError => {
                CooldownAction::CoolFor(self.transient_backoff(consecutive_failures))
            }
            PollResult::FatalError => CooldownAction::Retire,
        }
    }

    fn transient_backoff(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(16);
        let grown = self
            .transient_base
            .saturating_mul(2_u32.saturating_pow(exponent));
        grown.min(self.transient_cap)
    }
}
