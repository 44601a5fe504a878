//! Rotation pools for identities and egress paths
//!
//! Both pools share the same acquire/release/cooldown lifecycle but differ in
//! selection policy: identities rotate least-recently-used, egress paths
//! round-robin with a minimum dwell between reuses. All state transitions are
//! serialized behind an async mutex so concurrent poll workers can never claim
//! the same member twice.

mod egress;
mod identity;

pub use egress::{EgressLease, EgressPool, EgressSnapshot};
pub use identity::{
    CredentialRef, IdentityLease, IdentityPool, IdentitySnapshot, SessionHandle,
};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Lifecycle state of a pool member
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MemberState {
    /// Eligible for selection
    Available,
    /// Claimed by an in-flight poll
    InUse,
    /// Timed out of rotation until `cooldown_until`
    Cooling,
    /// Out of rotation until external intervention
    Failed,
}

/// Errors surfaced by the pools
#[derive(Error, Debug)]
pub enum PoolError {
    /// No member is currently eligible; `retry_at` is the earliest moment one
    /// may become eligible again, `None` if nothing is cooling
    #[error("pool exhausted, retry at {retry_at:?}")]
    Exhausted { retry_at: Option<DateTime<Utc>> },

    /// Bootstrap could not establish a session
    #[error("login failed for {identity}: {reason}")]
    LoginFailed { identity: String, reason: String },

    /// Release or bootstrap named a member the pool does not own
    #[error("unknown pool member: {0}")]
    UnknownMember(String),
}
