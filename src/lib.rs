//! talon - Authenticated list watcher
//!
//! Continuously polls a content list behind an authenticated session,
//! extracting items newer than the last observed one. Provider rate limiting
//! is survived by rotating among independent identities and, optionally,
//! multiple network egress paths.
//!
//! # Architecture
//!
//! - [`config`] - Configuration management and settings
//! - [`pool`] - Identity and egress rotation pools
//! - [`limiter`] - Rate-limit detection and cooldown policy
//! - [`watermark`] - Incremental deduplication and the durable watermark
//! - [`scheduler`] - The polling control loop
//! - [`renderer`] - Authenticated fetch of the watched list
//! - [`parser`] - Normalization of the provider's nested response schema
//! - [`storage`] - Output sink and durable runtime state
//!
//! # Example
//!
//! ```no_run
//! use talon::config::Config;
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::from_file(Path::new("talon.toml"))?;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod limiter;
pub mod models;
pub mod parser;
pub mod pool;
pub mod renderer;
pub mod scheduler;
pub mod storage;
pub mod watermark;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::limiter::{Classifier, CooldownPolicy};
    pub use crate::models::{PollOutcome, PollResult, RawPayload, Record};
    pub use crate::pool::{EgressPool, IdentityPool, PoolError};
    pub use crate::scheduler::{PollScheduler, SchedulerConfig};
}

// Direct re-exports for convenience
pub use models::{PollOutcome, PollResult, RawPayload, Record};
