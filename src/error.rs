//! Error types for stampede.

use std::time::Duration;

use thiserror::Error;

use crate::model::{JobId, JobStatus};

/// Boxed error returned by generation collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    /// The shared state store could not be reached. Callers fail open.
    #[error("shared state store unavailable: {0}")]
    StoreUnavailable(String),

    /// The generation collaborator failed. Never cached.
    #[error("compute failed: {0}")]
    Compute(#[source] BoxError),

    /// A job used up its retry budget and was dead-lettered.
    #[error("job {id} dead-lettered after {attempts} attempts: {error}")]
    JobExhausted {
        id: JobId,
        attempts: u32,
        error: String,
    },

    /// Admission denied. Retryable after `retry_after`.
    #[error("client {client_id} throttled at {limit} requests per window")]
    Throttled {
        client_id: String,
        limit: u32,
        retry_after: Duration,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// The caller's lease on a job ran out and the job moved on without it.
    #[error("job {id} is no longer leased to {worker_id}")]
    LeaseLost { id: JobId, worker_id: String },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Throttled { .. } | Error::StoreUnavailable(_))
    }

    /// Wrap a collaborator error.
    pub fn compute(err: impl Into<BoxError>) -> Self {
        Error::Compute(err.into())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("row".to_string()),
            other => Error::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::StoreUnavailable(format!("migration failed: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
