//! Identity pool with least-recently-used rotation
//!
//! Each identity owns one authenticated session. Selection prefers the
//! longest-idle available identity; on equal idle time the member configured
//! first wins, biasing load toward the primary account. Cooldowns are applied
//! on release from the classified poll outcome.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{MemberState, PoolError};
use crate::limiter::{CooldownAction, CooldownPolicy};
use crate::models::{PollOutcome, PollResult};
use crate::renderer::SessionBroker;

/// Opaque authenticated session state, established by `bootstrap` and
/// persisted across restarts. The pool never inspects its contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle(pub String);

/// Environment variable names holding an account's credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRef {
    pub username_env: String,
    pub password_env: String,
}

/// One account in the rotation
#[derive(Debug, Clone)]
struct Identity {
    id: String,
    credential: CredentialRef,
    session: Option<SessionHandle>,
    state: MemberState,
    cooldown_until: Option<DateTime<Utc>>,
    last_used: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

/// Claim on an identity, valid until released back to the pool
#[derive(Debug, Clone)]
pub struct IdentityLease {
    pub id: String,
    pub credential: CredentialRef,
    pub session: Option<SessionHandle>,
    /// Failure streak at acquire time, used by outcome classification
    pub consecutive_failures: u32,
}

/// Durable per-identity state, persisted between runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    pub id: String,
    pub session: Option<SessionHandle>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub failed: bool,
}

/// Pool of authenticated identities with LRU selection
pub struct IdentityPool {
    inner: Mutex<Vec<Identity>>,
    policy: CooldownPolicy,
}

impl IdentityPool {
    /// Create a pool from configured accounts, in configuration order.
    /// Insertion order is the LRU tie-break order.
    pub fn new(accounts: Vec<(String, CredentialRef)>, policy: CooldownPolicy) -> Self {
        let members = accounts
            .into_iter()
            .map(|(id, credential)| Identity {
                id,
                credential,
                session: None,
                state: MemberState::Available,
                cooldown_until: None,
                last_used: None,
                consecutive_failures: 0,
            })
            .collect();

        Self {
            inner: Mutex::new(members),
            policy,
        }
    }

    /// Claim the best available identity
    pub async fn acquire(&self) -> Result<IdentityLease, PoolError> {
        self.acquire_at(Utc::now()).await
    }

    /// Claim the best available identity as of `now`
    ///
    /// Members whose cooldown elapsed are promoted back to `Available` first,
    /// then the least-recently-used available member is claimed. Never-used
    /// members sort before used ones.
    pub async fn acquire_at(&self, now: DateTime<Utc>) -> Result<IdentityLease, PoolError> {
        let mut members = self.inner.lock().await;

        for member in members.iter_mut() {
            if member.state == MemberState::Cooling
                && member.cooldown_until.is_some_and(|until| now >= until)
            {
                member.state = MemberState::Available;
                member.cooldown_until = None;
            }
        }

        // Strict less-than comparison keeps the lower insertion index on ties.
        let mut best: Option<usize> = None;
        for (idx, member) in members.iter().enumerate() {
            if member.state != MemberState::Available {
                continue;
            }
            match best {
                None => best = Some(idx),
                Some(current) => {
                    if idle_key(&members[current]) > idle_key(member) {
                        best = Some(idx);
                    }
                }
            }
        }

        match best {
            Some(idx) => {
                let member = &mut members[idx];
                member.state = MemberState::InUse;
                debug!(identity = %member.id, "identity acquired");
                Ok(IdentityLease {
                    id: member.id.clone(),
                    credential: member.credential.clone(),
                    session: member.session.clone(),
                    consecutive_failures: member.consecutive_failures,
                })
            }
            None => {
                let retry_at = members
                    .iter()
                    .filter(|m| m.state == MemberState::Cooling)
                    .filter_map(|m| m.cooldown_until)
                    .min();
                Err(PoolError::Exhausted { retry_at })
            }
        }
    }

    /// Release an identity with the classified outcome of its poll
    pub async fn release(&self, id: &str, outcome: &PollOutcome) -> Result<(), PoolError> {
        self.release_at(id, outcome, Utc::now()).await
    }

    /// Release an identity as of `now`, applying the cooldown policy.
    /// `last_used` is updated regardless of outcome.
    pub async fn release_at(
        &self,
        id: &str,
        outcome: &PollOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), PoolError> {
        let mut members = self.inner.lock().await;
        let member = members
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| PoolError::UnknownMember(id.to_string()))?;

        member.last_used = Some(now);

        match outcome.result {
            PollResult::DataFound => member.consecutive_failures = 0,
            PollResult::TransientError => member.consecutive_failures += 1,
            _ => {}
        }

        match self
            .policy
            .action_for(outcome.result, member.consecutive_failures)
        {
            CooldownAction::Available => {
                member.state = MemberState::Available;
                member.cooldown_until = None;
            }
            CooldownAction::CoolFor(duration) => {
                let until = now
                    + ChronoDuration::from_std(duration)
                        .unwrap_or_else(|_| ChronoDuration::seconds(0));
                member.state = MemberState::Cooling;
                member.cooldown_until = Some(until);
                debug!(identity = %member.id, result = ?outcome.result, until = %until, "identity cooling");
            }
            CooldownAction::Retire => {
                member.state = MemberState::Failed;
                member.cooldown_until = None;
                warn!(identity = %member.id, error = ?outcome.raw_error, "identity retired from rotation");
            }
        }

        Ok(())
    }

    /// Return a claimed identity untouched, as if never acquired.
    /// Used when the egress pool turned out to be exhausted, and when a poll
    /// failed at the connectivity level and the blame lies with the path.
    pub async fn cancel(&self, id: &str) -> Result<(), PoolError> {
        let mut members = self.inner.lock().await;
        let member = members
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| PoolError::UnknownMember(id.to_string()))?;
        if member.state == MemberState::InUse {
            member.state = MemberState::Available;
        }
        Ok(())
    }

    /// Establish a session for one identity if it has none. Idempotent.
    /// A failed login retires the identity.
    pub async fn bootstrap(&self, id: &str, broker: &dyn SessionBroker) -> Result<(), PoolError> {
        let credential = {
            let members = self.inner.lock().await;
            let member = members
                .iter()
                .find(|m| m.id == id)
                .ok_or_else(|| PoolError::UnknownMember(id.to_string()))?;
            if member.session.is_some() {
                return Ok(());
            }
            member.credential.clone()
        };

        // Login runs outside the lock; it can take seconds. A concurrent
        // bootstrap may finish first, so the session is re-checked before
        // storing and the first established session wins.
        match broker.login(id, &credential).await {
            Ok(session) => {
                let mut members = self.inner.lock().await;
                if let Some(member) = members.iter_mut().find(|m| m.id == id) {
                    if member.session.is_none() {
                        member.session = Some(session);
                    }
                    if member.state == MemberState::Failed {
                        member.state = MemberState::Available;
                    }
                }
                Ok(())
            }
            Err(err) => {
                let mut members = self.inner.lock().await;
                if let Some(member) = members.iter_mut().find(|m| m.id == id) {
                    // A session established concurrently makes this failure moot
                    if member.session.is_none() {
                        member.state = MemberState::Failed;
                    }
                }
                Err(PoolError::LoginFailed {
                    identity: id.to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Bootstrap every identity, returning how many ended up usable
    pub async fn bootstrap_all(&self, broker: &dyn SessionBroker) -> usize {
        let ids: Vec<String> = {
            let members = self.inner.lock().await;
            members.iter().map(|m| m.id.clone()).collect()
        };

        let mut ready = 0;
        for id in ids {
            match self.bootstrap(&id, broker).await {
                Ok(()) => ready += 1,
                Err(err) => warn!(identity = %id, error = %err, "bootstrap failed"),
            }
        }
        ready
    }

    /// Store a freshly established session for an identity
    pub async fn set_session(&self, id: &str, session: SessionHandle) -> Result<(), PoolError> {
        let mut members = self.inner.lock().await;
        let member = members
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| PoolError::UnknownMember(id.to_string()))?;
        member.session = Some(session);
        Ok(())
    }

    /// Earliest moment any cooling member becomes eligible again
    pub async fn min_cooldown(&self) -> Option<DateTime<Utc>> {
        let members = self.inner.lock().await;
        members
            .iter()
            .filter(|m| m.state == MemberState::Cooling)
            .filter_map(|m| m.cooldown_until)
            .min()
    }

    /// Number of members still in rotation (anything but `Failed`)
    pub async fn active_count(&self) -> usize {
        let members = self.inner.lock().await;
        members
            .iter()
            .filter(|m| m.state != MemberState::Failed)
            .count()
    }

    /// Durable state for persistence. In-flight members snapshot as available;
    /// a restart clears any claim.
    pub async fn snapshot(&self) -> Vec<IdentitySnapshot> {
        let members = self.inner.lock().await;
        members
            .iter()
            .map(|m| IdentitySnapshot {
                id: m.id.clone(),
                session: m.session.clone(),
                cooldown_until: m.cooldown_until,
                last_used: m.last_used,
                consecutive_failures: m.consecutive_failures,
                failed: m.state == MemberState::Failed,
            })
            .collect()
    }

    /// Restore durable state saved by a previous run, matched by id.
    /// Snapshots for accounts no longer configured are ignored.
    pub async fn restore(&self, snapshots: &[IdentitySnapshot]) {
        let mut members = self.inner.lock().await;
        for snap in snapshots {
            if let Some(member) = members.iter_mut().find(|m| m.id == snap.id) {
                member.session = snap.session.clone();
                member.cooldown_until = snap.cooldown_until;
                member.last_used = snap.last_used;
                member.consecutive_failures = snap.consecutive_failures;
                member.state = if snap.failed {
                    MemberState::Failed
                } else if snap.cooldown_until.is_some() {
                    MemberState::Cooling
                } else {
                    MemberState::Available
                };
            }
        }
    }
}

/// Sort key for LRU selection: never-used members first, then oldest use
fn idle_key(member: &Identity) -> (bool, DateTime<Utc>) {
    match member.last_used {
        None => (false, DateTime::<Utc>::MIN_UTC),
        Some(at) => (true, at),
    }
}
