//! Unified error handling for the talon crate
//!
//! Domain-specific errors live next to their modules; this enum wraps them
//! into a single type usable across module boundaries, with a [`Result`]
//! alias. Recoverability drives the scheduler's retry decisions at the top
//! level: recoverable errors stay inside the loop, everything else surfaces.

use std::io;
use thiserror::Error;

pub use crate::parser::NormalizeError;
pub use crate::pool::PoolError;
pub use crate::renderer::FetchError;
pub use crate::storage::StoreError;
pub use crate::watermark::WatermarkError;

/// Unified error type for the talon crate
#[derive(Error, Debug)]
pub enum Error {
    /// Pool acquisition, release, or bootstrap errors
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Fetch and login errors
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Payload normalization errors
    #[error("normalize error: {0}")]
    Normalize(#[from] NormalizeError),

    /// Sink and state persistence errors
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Watermark persistence errors
    #[error("watermark error: {0}")]
    Watermark(#[from] WatermarkError),

    /// Every identity has been retired; the process cannot make progress
    #[error("all identities failed; manual intervention required")]
    IdentitiesExhausted,

    /// Configuration errors
    #[error("config error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the scheduler may keep running after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Pool(PoolError::Exhausted { .. }) => true,
            Self::Pool(_) => false,
            Self::Fetch(_) | Self::Normalize(_) => true,
            Self::Store(_) | Self::Watermark(_) | Self::Io(_) => true,
            Self::IdentitiesExhausted | Self::Config(_) | Self::Json(_) => false,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
