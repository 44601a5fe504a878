//! End-to-end scheduler behavior with a scripted renderer
//!
//! The renderer is replaced by a scripted fake so each test controls exactly
//! what every poll returns, and the cooldown policy is shrunk to milliseconds
//! so parking and rotation play out in real time.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::watch;

use talon::config::EgressConfig;
use talon::error::Error;
use talon::limiter::{Classifier, CooldownPolicy};
use talon::models::{RawPayload, Record};
use talon::parser::{NormalizeError, ResponseNormalizer};
use talon::pool::{CredentialRef, EgressLease, EgressPool, IdentityLease, IdentityPool};
use talon::renderer::{ContentRenderer, FetchError};
use talon::scheduler::{PollScheduler, SchedulerConfig};
use talon::storage::{Sink, StateStore, StoreError};
use talon::watermark::WatermarkStore;

/// One scripted poll response
enum Step {
    Records(Vec<u64>),
    RateLimited,
    AuthExpired,
    Timeout,
    ConnectFailed,
}

/// Renderer that replays a script and records which identity and egress path
/// served each poll
#[derive(Clone)]
struct ScriptedRenderer {
    script: Arc<Mutex<VecDeque<Step>>>,
    calls: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl ScriptedRenderer {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            script: Arc::new(Mutex::new(steps.into())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }

    fn identities_used(&self) -> Vec<String> {
        self.calls().into_iter().map(|(id, _)| id).collect()
    }
}

#[async_trait]
impl ContentRenderer for ScriptedRenderer {
    async fn fetch(
        &self,
        identity: &IdentityLease,
        egress: Option<&EgressLease>,
    ) -> Result<RawPayload, FetchError> {
        self.calls.lock().unwrap().push((
            identity.id.clone(),
            egress.map(|lease| lease.id.clone()),
        ));

        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Records(ids)) => Ok(RawPayload {
                pages: vec![json!({ "ids": ids })],
                scroll_cycles: 0,
            }),
            Some(Step::RateLimited) => Err(FetchError::RateLimited("status 429".into())),
            Some(Step::AuthExpired) => Err(FetchError::AuthExpired),
            Some(Step::Timeout) => Err(FetchError::Timeout),
            Some(Step::ConnectFailed) => Err(FetchError::Connect("connection refused".into())),
            None => Ok(RawPayload::empty()),
        }
    }
}

/// Normalizer matching the scripted payload shape
struct IdNormalizer;

impl ResponseNormalizer for IdNormalizer {
    fn normalize(&self, payload: &RawPayload) -> Result<Vec<Record>, NormalizeError> {
        let Some(page) = payload.pages.first() else {
            return Ok(Vec::new());
        };
        let ids = page
            .get("ids")
            .and_then(Value::as_array)
            .ok_or_else(|| NormalizeError::Schema("missing ids".into()))?;
        Ok(ids
            .iter()
            .filter_map(Value::as_u64)
            .map(|id| Record::new(id, "author", format!("item {id}")))
            .collect())
    }
}

/// Sink collecting emitted ids; `failures` is how many upcoming emissions
/// should fail before the sink recovers
#[derive(Clone)]
struct VecSink {
    emitted: Arc<Mutex<Vec<u64>>>,
    failures: Arc<AtomicUsize>,
}

impl VecSink {
    fn new() -> Self {
        Self {
            emitted: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn ids(&self) -> Vec<u64> {
        self.emitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sink for VecSink {
    async fn emit(&self, records: &[Record]) -> Result<(), StoreError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "sink unavailable",
            )));
        }
        self.emitted
            .lock()
            .unwrap()
            .extend(records.iter().map(|r| r.id));
        Ok(())
    }
}

fn cred(name: &str) -> CredentialRef {
    CredentialRef {
        username_env: format!("{}_USER", name.to_uppercase()),
        password_env: format!("{}_PASS", name.to_uppercase()),
    }
}

/// Millisecond-scale cooldowns so tests run fast
fn fast_policy() -> CooldownPolicy {
    CooldownPolicy {
        rate_limited: Duration::from_millis(100),
        quiet: Duration::from_millis(50),
        transient_base: Duration::from_millis(20),
        transient_cap: Duration::from_millis(80),
    }
}

struct Harness {
    scheduler: PollScheduler<ScriptedRenderer, IdNormalizer, VecSink>,
    renderer: ScriptedRenderer,
    sink: VecSink,
    // Held so the shutdown channel stays open; a closed channel would cut
    // every scheduler sleep short
    _stop: watch::Sender<bool>,
    _dir: TempDir,
}

fn harness(
    identities: &[&str],
    egress: Option<Vec<EgressConfig>>,
    steps: Vec<Step>,
    record_limit: usize,
) -> Harness {
    harness_with(identities, egress, steps, record_limit, true)
}

fn harness_with(
    identities: &[&str],
    egress: Option<Vec<EgressConfig>>,
    steps: Vec<Step>,
    record_limit: usize,
    run_once: bool,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(IdentityPool::new(
        identities
            .iter()
            .map(|n| (n.to_string(), cred(n)))
            .collect(),
        fast_policy(),
    ));
    let egress = egress.map(|descriptors| {
        Arc::new(EgressPool::new(
            descriptors,
            Duration::from_secs(0),
            Duration::from_millis(100),
        ))
    });

    let renderer = ScriptedRenderer::new(steps);
    let sink = VecSink::new();
    let (tx, rx) = watch::channel(false);

    let scheduler = PollScheduler::new(
        SchedulerConfig {
            poll_interval: Duration::from_millis(20),
            fetch_timeout: Duration::from_secs(5),
            record_limit,
            run_once,
        },
        pool,
        egress,
        Classifier::with_defaults(3),
        renderer.clone(),
        IdNormalizer,
        sink.clone(),
        WatermarkStore::new(dir.path().join("watermark.json")),
        StateStore::new(dir.path()),
        rx,
    );

    Harness {
        scheduler,
        renderer,
        sink,
        _stop: tx,
        _dir: dir,
    }
}

#[tokio::test]
async fn rate_limited_identity_is_rotated_out() {
    let mut h = harness(
        &["alpha", "beta"],
        None,
        vec![Step::RateLimited, Step::Records(vec![105, 102])],
        0,
    );

    h.scheduler.run().await.unwrap();
    assert!(h.sink.ids().is_empty());

    // The next poll must select the other identity without intervention
    h.scheduler.run().await.unwrap();
    assert_eq!(h.renderer.identities_used(), vec!["alpha", "beta"]);
    assert_eq!(h.sink.ids(), vec![105, 102]);
    assert_eq!(h.scheduler.watermark(), Some(105));
}

#[tokio::test]
async fn exhaustion_parks_and_resumes_automatically() {
    let mut h = harness(
        &["alpha", "beta"],
        None,
        vec![Step::RateLimited, Step::RateLimited, Step::Records(vec![110])],
        0,
    );

    h.scheduler.run().await.unwrap();
    h.scheduler.run().await.unwrap();

    // Both identities are cooling; this pass parks until the earliest
    // cooldown elapses and completes no poll.
    let started = Instant::now();
    let summary = h.scheduler.run().await.unwrap();
    assert_eq!(summary.cycles, 0);
    assert!(started.elapsed() >= Duration::from_millis(80));

    // After the park the roster is usable again and the poll succeeds
    h.scheduler.run().await.unwrap();
    assert_eq!(
        h.renderer.identities_used(),
        vec!["alpha", "beta", "alpha"]
    );
    assert_eq!(h.sink.ids(), vec![110]);
}

#[tokio::test]
async fn watermark_is_committed_only_after_emission() {
    let mut h = harness(&["alpha"], None, vec![Step::Records(vec![105, 102])], 0);

    h.sink.failures.store(1, Ordering::SeqCst);
    let result = h.scheduler.run().await;
    assert!(matches!(result, Err(Error::Store(_))));
    // Nothing was emitted, so nothing may be committed
    assert_eq!(h.scheduler.watermark(), None);

    // The same batch is re-delivered once the sink recovers
    h.renderer.push(Step::Records(vec![105, 102]));
    h.scheduler.run().await.unwrap();
    assert_eq!(h.sink.ids(), vec![105, 102]);
    assert_eq!(h.scheduler.watermark(), Some(105));
}

#[tokio::test]
async fn previously_seen_records_are_not_re_emitted() {
    let mut h = harness(
        &["alpha", "beta"],
        None,
        vec![
            Step::Records(vec![105, 102, 100, 98]),
            Step::Records(vec![105, 102, 100, 98]),
        ],
        0,
    );

    h.scheduler.run().await.unwrap();
    assert_eq!(h.sink.ids(), vec![105, 102, 100, 98]);
    assert_eq!(h.scheduler.watermark(), Some(105));

    // An overlapping batch produces no duplicate emissions
    h.scheduler.run().await.unwrap();
    assert_eq!(h.sink.ids(), vec![105, 102, 100, 98]);
    assert_eq!(h.scheduler.watermark(), Some(105));
}

#[tokio::test]
async fn record_limit_redelivers_withheld_records() {
    let mut h = harness(
        &["alpha", "beta"],
        None,
        vec![
            Step::Records(vec![110, 108, 105, 102]),
            Step::Records(vec![110, 108, 105, 102]),
        ],
        2,
    );

    // The oldest two are delivered first and the watermark stays below the
    // withheld records
    h.scheduler.run().await.unwrap();
    assert_eq!(h.sink.ids(), vec![105, 102]);
    assert_eq!(h.scheduler.watermark(), Some(105));

    // The withheld newer records arrive on the following cycle
    h.scheduler.run().await.unwrap();
    assert_eq!(h.sink.ids(), vec![105, 102, 110, 108]);
    assert_eq!(h.scheduler.watermark(), Some(110));
}

#[tokio::test]
async fn losing_every_identity_stops_the_run() {
    let mut h = harness(&["alpha"], None, vec![Step::AuthExpired], 0);

    let result = h.scheduler.run().await;
    assert!(matches!(result, Err(Error::IdentitiesExhausted)));
}

#[tokio::test]
async fn repeated_timeouts_retire_an_identity() {
    // Threshold is 3: two timeouts stay transient, the third is fatal
    let mut h = harness(
        &["alpha"],
        None,
        vec![Step::Timeout, Step::Timeout, Step::Timeout],
        0,
    );

    h.scheduler.run().await.unwrap();
    tokio::time::sleep(Duration::from_millis(25)).await;
    h.scheduler.run().await.unwrap();
    tokio::time::sleep(Duration::from_millis(45)).await;

    let result = h.scheduler.run().await;
    assert!(matches!(result, Err(Error::IdentitiesExhausted)));
}

#[tokio::test]
async fn connectivity_failure_cools_the_egress_path_not_the_identity() {
    let descriptors = vec![
        EgressConfig {
            id: "p1".into(),
            url: "http://p1.proxy.example:8080".into(),
            username_env: None,
            password_env: None,
        },
        EgressConfig {
            id: "p2".into(),
            url: "http://p2.proxy.example:8080".into(),
            username_env: None,
            password_env: None,
        },
    ];
    let mut h = harness(
        &["alpha"],
        Some(descriptors),
        vec![Step::ConnectFailed, Step::Records(vec![105])],
        0,
    );

    h.scheduler.run().await.unwrap();
    // alpha is untouched by the path failure and immediately available
    h.scheduler.run().await.unwrap();

    // Same identity both times, but the cooled path p1 is skipped for p2
    assert_eq!(
        h.renderer.calls(),
        vec![
            ("alpha".to_string(), Some("p1".to_string())),
            ("alpha".to_string(), Some("p2".to_string())),
        ]
    );
    assert_eq!(h.sink.ids(), vec![105]);
}

#[tokio::test]
async fn egress_connectivity_failures_never_retire_the_identity() {
    let descriptors = (1..=3)
        .map(|n| EgressConfig {
            id: format!("p{n}"),
            url: format!("http://p{n}.proxy.example:8080"),
            username_env: None,
            password_env: None,
        })
        .collect();
    let mut h = harness(
        &["alpha"],
        Some(descriptors),
        vec![
            Step::ConnectFailed,
            Step::ConnectFailed,
            Step::ConnectFailed,
            Step::Records(vec![105]),
        ],
        0,
    );

    // As many path failures as the retirement threshold; the blame lies with
    // the paths, so the identity's failure streak must not grow.
    h.scheduler.run().await.unwrap();
    h.scheduler.run().await.unwrap();
    h.scheduler.run().await.unwrap();

    // Every path is cooling, so this pass parks instead of polling
    let summary = h.scheduler.run().await.unwrap();
    assert_eq!(summary.cycles, 0);

    // The identity is still in rotation and completes the next poll
    h.scheduler.run().await.unwrap();
    assert_eq!(h.sink.ids(), vec![105]);
    assert!(h.renderer.identities_used().iter().all(|id| id == "alpha"));
}

#[tokio::test]
async fn continuous_watch_survives_a_transient_sink_failure() {
    let mut h = harness_with(
        &["alpha", "beta"],
        None,
        vec![Step::Records(vec![105, 102]), Step::Records(vec![105, 102])],
        0,
        false,
    );
    h.sink.failures.store(1, Ordering::SeqCst);

    // The first emission fails; a continuous watch must absorb the error and
    // re-deliver the batch on the next poll instead of exiting.
    let run = tokio::time::timeout(Duration::from_millis(400), h.scheduler.run()).await;
    assert!(run.is_err(), "continuous watch stopped instead of retrying");
    assert_eq!(h.sink.ids(), vec![105, 102]);
    assert_eq!(h.scheduler.watermark(), Some(105));
}
