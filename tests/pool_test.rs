//! Pool rotation under concurrent callers

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use talon::config::EgressConfig;
use talon::limiter::CooldownPolicy;
use talon::models::PollOutcome;
use talon::pool::{CredentialRef, EgressPool, IdentityPool, PoolError, SessionHandle};
use talon::renderer::{FetchError, SessionBroker};

fn cred(name: &str) -> CredentialRef {
    CredentialRef {
        username_env: format!("{}_USER", name.to_uppercase()),
        password_env: format!("{}_PASS", name.to_uppercase()),
    }
}

fn identity_pool(names: &[&str]) -> IdentityPool {
    IdentityPool::new(
        names.iter().map(|n| (n.to_string(), cred(n))).collect(),
        CooldownPolicy::default(),
    )
}

#[tokio::test]
async fn concurrent_acquirers_never_share_an_identity() {
    let pool = std::sync::Arc::new(identity_pool(&["a", "b", "c", "d"]));
    let held = std::sync::Arc::new(Mutex::new(HashSet::<String>::new()));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let pool = pool.clone();
        let held = held.clone();
        tasks.push(tokio::spawn(async move {
            let mut polls = 0;
            while polls < 25 {
                match pool.acquire().await {
                    Ok(lease) => {
                        {
                            let mut held = held.lock().unwrap();
                            assert!(
                                held.insert(lease.id.clone()),
                                "identity {} issued to two callers at once",
                                lease.id
                            );
                        }
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        held.lock().unwrap().remove(&lease.id);
                        pool.release(&lease.id, &PollOutcome::data_found(1))
                            .await
                            .unwrap();
                        polls += 1;
                    }
                    Err(PoolError::Exhausted { .. }) => {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    Err(err) => panic!("unexpected pool error: {err}"),
                }
            }
        }));
    }

    for result in join_all(tasks).await {
        result.unwrap();
    }
}

#[tokio::test]
async fn concurrent_acquirers_never_share_an_egress_path() {
    let descriptors = ["p1", "p2"]
        .iter()
        .map(|id| EgressConfig {
            id: id.to_string(),
            url: format!("http://{id}.proxy.example:8080"),
            username_env: None,
            password_env: None,
        })
        .collect();
    // Zero dwell so contention is the only constraint
    let pool = std::sync::Arc::new(EgressPool::new(
        descriptors,
        Duration::from_secs(0),
        Duration::from_secs(300),
    ));
    let held = std::sync::Arc::new(Mutex::new(HashSet::<String>::new()));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        let held = held.clone();
        tasks.push(tokio::spawn(async move {
            let mut polls = 0;
            while polls < 25 {
                match pool.acquire().await {
                    Ok(lease) => {
                        {
                            let mut held = held.lock().unwrap();
                            assert!(
                                held.insert(lease.id.clone()),
                                "egress path {} issued to two callers at once",
                                lease.id
                            );
                        }
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        held.lock().unwrap().remove(&lease.id);
                        pool.release(&lease.id, false).await.unwrap();
                        polls += 1;
                    }
                    Err(PoolError::Exhausted { .. }) => {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    Err(err) => panic!("unexpected pool error: {err}"),
                }
            }
        }));
    }

    for result in join_all(tasks).await {
        result.unwrap();
    }
}

/// Broker whose login blocks until the test releases it
struct GatedBroker {
    gate: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<()>>,
}

#[async_trait]
impl SessionBroker for GatedBroker {
    async fn login(
        &self,
        _id: &str,
        _credential: &CredentialRef,
    ) -> Result<SessionHandle, FetchError> {
        self.gate.lock().await.recv().await;
        Ok(SessionHandle("late-session".into()))
    }
}

#[tokio::test]
async fn bootstrap_keeps_the_first_established_session() {
    let pool = std::sync::Arc::new(identity_pool(&["alpha"]));
    let (release, gate) = tokio::sync::mpsc::channel(1);
    let broker = std::sync::Arc::new(GatedBroker {
        gate: tokio::sync::Mutex::new(gate),
    });

    let pending = tokio::spawn({
        let pool = pool.clone();
        let broker = broker.clone();
        async move { pool.bootstrap("alpha", broker.as_ref()).await }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Another session lands while the login above is still in flight
    pool.set_session("alpha", SessionHandle("first-session".into()))
        .await
        .unwrap();
    release.send(()).await.unwrap();
    pending.await.unwrap().unwrap();

    // The late login result must not clobber the established session
    let snaps = pool.snapshot().await;
    assert_eq!(snaps[0].session, Some(SessionHandle("first-session".into())));
}

#[tokio::test]
async fn rotation_walks_identities_in_lru_order() {
    let pool = identity_pool(&["a", "b", "c"]);

    // With quiet cooldowns in play, successive polls walk the whole roster
    // before coming back to the first member.
    let mut order = Vec::new();
    for _ in 0..3 {
        let lease = pool.acquire().await.unwrap();
        order.push(lease.id.clone());
        pool.release(&lease.id, &PollOutcome::data_found(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert_eq!(order, vec!["a", "b", "c"]);
}
