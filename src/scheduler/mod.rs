//! The polling control loop
//!
//! One cycle walks `Acquiring → Fetching → Normalizing → Deduplicating →
//! Emitting → Sleeping`; when no identity or egress path is available the loop
//! parks in `ExhaustedBackoff` until the earliest cooldown across the
//! exhausted pools elapses, then re-enters `Acquiring` directly. The scheduler
//! is the only orchestrator: concurrent workers, if configured, coordinate
//! solely through the pools, and the watermark is mutated only by the commit
//! step after a successful emission.

use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::limiter::{Classifier, CycleOutcome};
use crate::models::{PollResult, Record};
use crate::parser::ResponseNormalizer;
use crate::pool::{EgressLease, EgressPool, IdentityPool, PoolError};
use crate::renderer::{ContentRenderer, FetchError};
use crate::storage::{PoolState, Sink, StateStore};
use crate::watermark::{self, Filtered, WatermarkStore};

/// Phase of the polling state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Acquiring,
    Fetching,
    Normalizing,
    Deduplicating,
    Emitting,
    Sleeping,
    ExhaustedBackoff,
}

/// How one pass through the loop ended
enum CycleEnd {
    /// A poll ran to completion (successfully or not)
    Polled,
    /// Both pools were exhausted; backoff already slept
    Parked,
}

/// Scheduler tuning extracted from the full configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    /// Per-poll record limit, 0 for unbounded
    pub record_limit: usize,
    pub run_once: bool,
}

impl SchedulerConfig {
    pub fn from_config(config: &Config, run_once: bool) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            fetch_timeout: config.fetch_timeout(),
            record_limit: config.watch.record_limit,
            run_once,
        }
    }
}

/// Totals for a finished run
#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub cycles: u64,
    pub records_emitted: u64,
}

/// The polling control loop
pub struct PollScheduler<R, N, K> {
    config: SchedulerConfig,
    identities: Arc<IdentityPool>,
    egress: Option<Arc<EgressPool>>,
    classifier: Classifier,
    renderer: R,
    normalizer: N,
    sink: K,
    watermark_store: WatermarkStore,
    state_store: StateStore,
    watermark: Option<u64>,
    phase: Phase,
    shutdown: watch::Receiver<bool>,
}

impl<R, N, K> PollScheduler<R, N, K>
where
    R: ContentRenderer,
    N: ResponseNormalizer,
    K: Sink,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        identities: Arc<IdentityPool>,
        egress: Option<Arc<EgressPool>>,
        classifier: Classifier,
        renderer: R,
        normalizer: N,
        sink: K,
        watermark_store: WatermarkStore,
        state_store: StateStore,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            identities,
            egress,
            classifier,
            renderer,
            normalizer,
            sink,
            watermark_store,
            state_store,
            watermark: None,
            phase: Phase::Idle,
            shutdown,
        }
    }

    /// Current phase of the state machine
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Last committed watermark
    pub fn watermark(&self) -> Option<u64> {
        self.watermark
    }

    /// Run the polling loop until stopped, the single configured cycle
    /// completes, or no identity remains in rotation
    pub async fn run(&mut self) -> Result<RunSummary> {
        self.watermark = self.watermark_store.load()?;
        info!(watermark = ?self.watermark, "poll loop starting");

        let mut summary = RunSummary::default();

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.poll_cycle(&mut summary).await {
                Ok(CycleEnd::Polled) => {
                    summary.cycles += 1;
                    if self.config.run_once {
                        break;
                    }
                    self.sleep_between_polls().await;
                }
                Ok(CycleEnd::Parked) => {
                    if self.config.run_once {
                        break;
                    }
                    // Re-enter Acquiring directly; backoff already waited
                }
                // A recoverable failure (sink I/O, watermark write) costs one
                // cycle, not the whole watch. The uncommitted watermark means
                // the affected batch is re-delivered on the next poll.
                Err(err) if err.is_recoverable() && !self.config.run_once => {
                    summary.cycles += 1;
                    warn!(error = %err, "poll cycle failed, retrying on schedule");
                    self.sleep_between_polls().await;
                }
                Err(err) => return Err(err),
            }
        }

        self.set_phase(Phase::Idle);
        info!(
            cycles = summary.cycles,
            records = summary.records_emitted,
            "poll loop stopped"
        );
        Ok(summary)
    }

    async fn poll_cycle(&mut self, summary: &mut RunSummary) -> Result<CycleEnd> {
        self.set_phase(Phase::Acquiring);

        let identity = match self.identities.acquire().await {
            Ok(lease) => lease,
            Err(PoolError::Exhausted { retry_at }) => {
                self.exhausted_backoff(retry_at).await;
                return Ok(CycleEnd::Parked);
            }
            Err(err) => return Err(err.into()),
        };

        let egress: Option<EgressLease> = match &self.egress {
            Some(pool) => match pool.acquire().await {
                Ok(lease) => Some(lease),
                Err(PoolError::Exhausted { retry_at }) => {
                    self.identities.cancel(&identity.id).await?;
                    self.exhausted_backoff(retry_at).await;
                    return Ok(CycleEnd::Parked);
                }
                Err(err) => return Err(err.into()),
            },
            None => None,
        };

        self.set_phase(Phase::Fetching);
        debug!(identity = %identity.id, egress = ?egress.as_ref().map(|e| e.id.as_str()), "polling");

        let fetch_result = match tokio::time::timeout(
            self.config.fetch_timeout,
            self.renderer.fetch(&identity, egress.as_ref()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        };

        let mut records: Vec<Record> = Vec::new();
        let outcome = match &fetch_result {
            Ok(payload) => {
                self.set_phase(Phase::Normalizing);
                if payload.scroll_cycles > 0 {
                    debug!(scroll_cycles = payload.scroll_cycles, "renderer followed pagination");
                }
                let body = payload.pages.first().map(|page| page.to_string());
                match self.normalizer.normalize(payload) {
                    Ok(parsed) => {
                        records = parsed;
                        self.classifier.classify(
                            CycleOutcome::Fetched {
                                record_count: records.len(),
                                body: body.as_deref(),
                            },
                            identity.consecutive_failures,
                        )
                    }
                    Err(err) => self.classifier.classify(
                        CycleOutcome::NormalizeFailed {
                            error: &err,
                            body: body.as_deref(),
                        },
                        identity.consecutive_failures,
                    ),
                }
            }
            Err(err) => self
                .classifier
                .classify(CycleOutcome::FetchFailed(err), identity.consecutive_failures),
        };

        // Outcomes are attributed independently: the identity gets the
        // classified result, the egress path only connectivity failures. A
        // connectivity failure on a leased path belongs entirely to the path;
        // the identity goes back untouched, its failure streak does not grow.
        let connectivity = matches!(&fetch_result, Err(err) if err.is_connectivity());
        let egress_fault = connectivity && egress.is_some();

        if egress_fault {
            self.identities.cancel(&identity.id).await?;
        } else {
            self.identities.release(&identity.id, &outcome).await?;
        }
        if let (Some(pool), Some(lease)) = (&self.egress, &egress) {
            pool.release(&lease.id, connectivity).await?;
        }
        self.persist_pool_state().await;

        if egress_fault {
            info!(
                identity = %identity.id,
                egress = ?egress.as_ref().map(|e| e.id.as_str()),
                error = ?outcome.raw_error,
                "connectivity failure, egress path cooling"
            );
            return Ok(CycleEnd::Polled);
        }

        match outcome.result {
            PollResult::DataFound => {
                let emitted = self.dedup_and_emit(records).await?;
                summary.records_emitted += emitted;
            }
            PollResult::EmptyOk => {
                debug!(identity = %identity.id, "list quiet");
            }
            PollResult::RateLimited => {
                info!(identity = %identity.id, error = ?outcome.raw_error, "rate limited, rotating");
            }
            PollResult::TransientError => {
                debug!(identity = %identity.id, error = ?outcome.raw_error, "transient failure, retrying on schedule");
            }
            PollResult::FatalError => {
                error!(identity = %identity.id, error = ?outcome.raw_error, "identity removed from rotation");
                if self.identities.active_count().await == 0 {
                    return Err(Error::IdentitiesExhausted);
                }
            }
        }

        Ok(CycleEnd::Polled)
    }

    async fn dedup_and_emit(&mut self, records: Vec<Record>) -> Result<u64> {
        self.set_phase(Phase::Deduplicating);
        let filtered = watermark::filter(records, self.watermark);
        let (fresh, commit) = apply_record_limit(filtered, self.config.record_limit);

        if fresh.is_empty() {
            debug!("no records above watermark");
        } else {
            self.set_phase(Phase::Emitting);
            // Emit strictly before the watermark commit: a crash between the
            // two re-delivers on the next run instead of losing records.
            self.sink.emit(&fresh).await?;
            info!(count = fresh.len(), "new records emitted");
        }

        if let Some(mark) = commit {
            if self.watermark.map_or(true, |current| mark > current) {
                self.watermark_store.commit(mark)?;
                self.watermark = Some(mark);
            }
        }

        Ok(fresh.len() as u64)
    }

    async fn exhausted_backoff(&mut self, retry_at: Option<chrono::DateTime<Utc>>) {
        self.set_phase(Phase::ExhaustedBackoff);

        // Earliest eligibility across both pools; the acquire error already
        // carries the blocking pool's estimate.
        let mut wake = retry_at;
        if let Some(pool) = &self.egress {
            wake = match (wake, pool.min_cooldown().await) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        if let Some(identity_wake) = self.identities.min_cooldown().await {
            wake = Some(wake.map_or(identity_wake, |w| w.min(identity_wake)));
        }

        let wait = wake
            .and_then(|at| at.signed_duration_since(Utc::now()).to_std().ok())
            .unwrap_or(self.config.poll_interval);

        info!(wait_secs = wait.as_secs_f64(), "all pools exhausted, parking");
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    async fn sleep_between_polls(&mut self) {
        self.set_phase(Phase::Sleeping);
        let jitter_ms = {
            let ceiling = (self.config.poll_interval.as_millis() as u64 / 10).max(1);
            rand::thread_rng().gen_range(0..ceiling)
        };
        let interval = self.config.poll_interval + Duration::from_millis(jitter_ms);
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    async fn persist_pool_state(&self) {
        let state = PoolState {
            identities: self.identities.snapshot().await,
            egress: match &self.egress {
                Some(pool) => pool.snapshot().await,
                None => Vec::new(),
            },
        };
        if let Err(err) = self.state_store.save(&state) {
            warn!(error = %err, "failed to persist pool state");
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        trace!(from = ?self.phase, to = ?phase, "phase transition");
        self.phase = phase;
    }
}

/// Apply the per-poll record limit to a filtered batch.
///
/// When the limit truncates, the oldest eligible records are delivered and the
/// committed watermark is capped at the highest id actually emitted, so the
/// withheld newer records are re-delivered on the next cycle rather than
/// skipped.
fn apply_record_limit(filtered: Filtered, limit: usize) -> (Vec<Record>, Option<u64>) {
    let Filtered { fresh, candidate } = filtered;

    if limit == 0 || fresh.len() <= limit {
        return (fresh, candidate);
    }

    // fresh is newest-first; the tail holds the oldest records
    let start = fresh.len() - limit;
    let emitted: Vec<Record> = fresh[start..].to_vec();
    let capped = emitted.first().map(|r| r.id);
    (emitted, capped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Record;

    fn record(id: u64) -> Record {
        Record::new(id, "author", format!("item {id}"))
    }

    fn filtered(ids: &[u64]) -> Filtered {
        Filtered {
            fresh: ids.iter().copied().map(record).collect(),
            candidate: ids.iter().copied().max(),
        }
    }

    #[test]
    fn test_limit_zero_is_unbounded() {
        let (emitted, commit) = apply_record_limit(filtered(&[107, 105, 102]), 0);
        assert_eq!(emitted.len(), 3);
        assert_eq!(commit, Some(107));
    }

    #[test]
    fn test_limit_above_batch_size_is_noop() {
        let (emitted, commit) = apply_record_limit(filtered(&[107, 105]), 10);
        assert_eq!(emitted.len(), 2);
        assert_eq!(commit, Some(107));
    }

    #[test]
    fn test_limit_delivers_oldest_and_caps_watermark() {
        let (emitted, commit) = apply_record_limit(filtered(&[110, 108, 105, 102]), 2);
        let ids: Vec<u64> = emitted.iter().map(|r| r.id).collect();
        // Oldest two delivered, watermark capped so 110 and 108 return next cycle
        assert_eq!(ids, vec![105, 102]);
        assert_eq!(commit, Some(105));
    }

    #[test]
    fn test_limit_on_empty_batch() {
        let (emitted, commit) = apply_record_limit(
            Filtered {
                fresh: Vec::new(),
                candidate: Some(100),
            },
            5,
        );
        assert!(emitted.is_empty());
        assert_eq!(commit, Some(100));
    }
}
