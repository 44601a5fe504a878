//! Egress pool with round-robin rotation and dwell enforcement
//!
//! Egress paths carry no preference order, so selection is round-robin with a
//! minimum dwell between reuses of the same path. Only connectivity-level
//! failures cool a path; rate limits and auth failures belong to the identity
//! that made the request, never to the path it travelled.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::PoolError;
use crate::config::EgressConfig;

#[derive(Debug, Clone)]
struct EgressPath {
    descriptor: EgressConfig,
    cooldown_until: Option<DateTime<Utc>>,
    last_used: Option<DateTime<Utc>>,
    in_use: bool,
}

/// Claim on an egress path
#[derive(Debug, Clone)]
pub struct EgressLease {
    pub id: String,
    pub descriptor: EgressConfig,
}

/// Durable per-path state, persisted between runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressSnapshot {
    pub id: String,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

struct Inner {
    paths: Vec<EgressPath>,
    cursor: usize,
}

/// Round-robin pool of network egress paths
pub struct EgressPool {
    inner: Mutex<Inner>,
    /// Minimum idle time before the same path may be reused
    dwell: Duration,
    /// Cooldown applied after a connectivity failure
    cooldown: Duration,
}

impl EgressPool {
    pub fn new(descriptors: Vec<EgressConfig>, dwell: Duration, cooldown: Duration) -> Self {
        let paths = descriptors
            .into_iter()
            .map(|descriptor| EgressPath {
                descriptor,
                cooldown_until: None,
                last_used: None,
                in_use: false,
            })
            .collect();

        Self {
            inner: Mutex::new(Inner { paths, cursor: 0 }),
            dwell,
            cooldown,
        }
    }

    /// Claim the next eligible path in round-robin order
    pub async fn acquire(&self) -> Result<EgressLease, PoolError> {
        self.acquire_at(Utc::now()).await
    }

    /// Claim the next eligible path as of `now`
    pub async fn acquire_at(&self, now: DateTime<Utc>) -> Result<EgressLease, PoolError> {
        let mut inner = self.inner.lock().await;
        let len = inner.paths.len();
        if len == 0 {
            return Err(PoolError::Exhausted { retry_at: None });
        }

        for offset in 0..len {
            let idx = (inner.cursor + offset) % len;
            if self.eligible(&inner.paths[idx], now) {
                inner.cursor = (idx + 1) % len;
                let path = &mut inner.paths[idx];
                path.in_use = true;
                path.cooldown_until = None;
                debug!(egress = %path.descriptor.id, "egress path acquired");
                return Ok(EgressLease {
                    id: path.descriptor.id.clone(),
                    descriptor: path.descriptor.clone(),
                });
            }
        }

        let retry_at = inner
            .paths
            .iter()
            .filter(|p| !p.in_use)
            .filter_map(|p| self.eligible_at(p))
            .min();
        Err(PoolError::Exhausted { retry_at })
    }

    /// Release a path. A connectivity failure (refused connection, handshake
    /// failure, proxy unreachable) cools the path immediately; any other
    /// outcome belongs to the identity and leaves the path eligible after its
    /// dwell window.
    pub async fn release(&self, id: &str, connectivity_failure: bool) -> Result<(), PoolError> {
        self.release_at(id, connectivity_failure, Utc::now()).await
    }

    /// Release a path as of `now`
    pub async fn release_at(
        &self,
        id: &str,
        connectivity_failure: bool,
        now: DateTime<Utc>,
    ) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().await;
        let path = inner
            .paths
            .iter_mut()
            .find(|p| p.descriptor.id == id)
            .ok_or_else(|| PoolError::UnknownMember(id.to_string()))?;

        path.in_use = false;
        path.last_used = Some(now);
        if connectivity_failure {
            let until = now
                + ChronoDuration::from_std(self.cooldown)
                    .unwrap_or_else(|_| ChronoDuration::seconds(0));
            path.cooldown_until = Some(until);
            debug!(egress = %path.descriptor.id, until = %until, "egress path cooling after connectivity failure");
        }
        Ok(())
    }

    /// Return a claimed path untouched, as if never acquired
    pub async fn cancel(&self, id: &str) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().await;
        let path = inner
            .paths
            .iter_mut()
            .find(|p| p.descriptor.id == id)
            .ok_or_else(|| PoolError::UnknownMember(id.to_string()))?;
        path.in_use = false;
        Ok(())
    }

    /// Earliest moment any idle path becomes eligible again
    pub async fn min_cooldown(&self) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().await;
        inner
            .paths
            .iter()
            .filter(|p| !p.in_use)
            .filter_map(|p| self.eligible_at(p))
            .min()
    }

    pub async fn snapshot(&self) -> Vec<EgressSnapshot> {
        let inner = self.inner.lock().await;
        inner
            .paths
            .iter()
            .map(|p| EgressSnapshot {
                id: p.descriptor.id.clone(),
                cooldown_until: p.cooldown_until,
                last_used: p.last_used,
            })
            .collect()
    }

    pub async fn restore(&self, snapshots: &[EgressSnapshot]) {
        let mut inner = self.inner.lock().await;
        for snap in snapshots {
            if let Some(path) = inner
                .paths
                .iter_mut()
                .find(|p| p.descriptor.id == snap.id)
            {
                path.cooldown_until = snap.cooldown_until;
                path.last_used = snap.last_used;
            }
        }
    }

    fn eligible(&self, path: &EgressPath, now: DateTime<Utc>) -> bool {
        if path.in_use {
            return false;
        }
        if let Some(until) = path.cooldown_until {
            if now < until {
                return false;
            }
        }
        match path.last_used {
            None => true,
            Some(last) => {
                let idle = now.signed_duration_since(last);
                idle >= ChronoDuration::from_std(self.dwell)
                    .unwrap_or_else(|_| ChronoDuration::seconds(0))
            }
        }
    }

    /// When this idle path next becomes eligible: the later of cooldown expiry
    /// and dwell expiry
    fn eligible_at(&self, path: &EgressPath) -> Option<DateTime<Utc>> {
        let dwell = ChronoDuration::from_std(self.dwell).ok()?;
        let dwell_ready = path.last_used.map(|last| last + dwell);
        match (path.cooldown_until, dwell_ready) {
            (Some(cool), Some(ready)) => Some(cool.max(ready)),
            (Some(cool), None) => Some(cool),
            (None, Some(ready)) => Some(ready),
            (None, None) => None,
        }
    }
}
