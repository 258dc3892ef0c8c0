//! Common error types shared across services.
//!
//! The variants mirror the failure classes a job can run into: bad client
//! input, infrastructure trouble (database, artifact store), external tool
//! failures, and handler timeouts. Worker code folds these into the
//! `error_message` column; submission code maps [`JobError::InvalidInput`]
//! to a 400 before a job row ever exists.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    /// Client-supplied request was malformed (unknown tool, wrong file
    /// arity, invalid options). Never reaches a worker.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("storage error: {0}")]
    Storage(String),
    /// An external tool exited non-zero. `stderr` is pre-truncated and must
    /// never contain passwords or credentials.
    #[error("{tool} failed ({code}): {stderr}")]
    ToolProcess {
        tool: &'static str,
        code: String,
        stderr: String,
    },
    #[error("{tool} timed out after {seconds}s")]
    ToolTimeout { tool: &'static str, seconds: u64 },
}

impl From<tokio_postgres::Error> for JobError {
    fn from(err: tokio_postgres::Error) -> Self {
        JobError::Database(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for JobError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        JobError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for JobError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest errors embed the full URL; strip query strings so signed
        // parameters never end up in job rows or logs.
        JobError::Storage(err.without_url().to_string())
    }
}

/// Convenience alias for results that use [`JobError`].
pub type Result<T> = std::result::Result<T, JobError>;
