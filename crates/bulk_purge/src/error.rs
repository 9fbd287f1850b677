//! Errors surfaced by [`DocumentStore`](crate::store::DocumentStore) backends.
//!
//! Engine plumbing uses `anyhow`; only the store seam is typed, because the
//! sampler and executor have to tell "counter unsupported" and "transient
//! transaction abort" apart from real failures.

use thiserror::Error;

/// Failure reported by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend does not implement the requested command or counter.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// The session lacks the privileges for an administrative command.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// A transaction was aborted for a reason that may clear on retry.
    #[error("transient transaction error: {0}")]
    Transient(String),

    /// The filter could not be evaluated by the backend.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// The namespace cannot be represented by the backend.
    #[error("invalid namespace {0:?}")]
    InvalidNamespace(String),

    /// Underlying storage or I/O failure.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("document encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl StoreError {
    /// True for errors a retry of the same batch may clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// True when a telemetry command is unavailable rather than broken
    /// (older servers, restricted roles).
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unsupported(_) | Self::Unauthorized(_))
    }
}

impl From<fjall::Error> for StoreError {
    fn from(err: fjall::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
