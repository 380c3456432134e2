//! Typed errors at the store seam.
//!
//! Pattern-matchable variants cover the cases callers branch on (duplicate
//! submission, missing job); everything else (I/O, corruption, pool
//! exhaustion) collapses into `Unavailable`, which drivers treat as fatal
//! for the operation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A job with this id already exists; the original record is unchanged.
    #[error("job `{0}` already exists")]
    DuplicateId(String),

    /// No job with this id.
    #[error("job `{0}` not found")]
    NotFound(String),

    /// The backing store could not service the request.
    #[error("store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

impl StoreError {
    pub fn unavailable(err: impl Into<anyhow::Error>) -> Self {
        StoreError::Unavailable(err.into())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
