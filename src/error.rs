use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Analytics API unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Analytics API rate limited after {attempts} attempts")]
    UpstreamRateLimited {
        attempts: u32,
        retry_after: Option<Duration>,
    },

    #[error("Analytics API request timed out after {0:?}")]
    UpstreamTimeout(Duration),

    #[error("Malformed analytics API response: {0}")]
    UpstreamMalformedResponse(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Storage operation timed out after {0:?}")]
    StorageTimeout(Duration),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("A pipeline run is already in progress")]
    RunAlreadyInProgress,

    #[error("Pipeline run cancelled")]
    RunCancelled,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Migration error: {0}")]
    Migration(String),
}

/// Stable identifier for each failure class. Persisted in run history and
/// used by invocation boundaries to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UpstreamUnavailable,
    UpstreamRateLimited,
    UpstreamTimeout,
    UpstreamMalformedResponse,
    StorageUnavailable,
    StorageTimeout,
    ConstraintViolation,
    RunAlreadyInProgress,
    RunCancelled,
    InvalidArgument,
    Config,
    Migration,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::UpstreamRateLimited => "upstream_rate_limited",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::UpstreamMalformedResponse => "upstream_malformed_response",
            ErrorKind::StorageUnavailable => "storage_unavailable",
            ErrorKind::StorageTimeout => "storage_timeout",
            ErrorKind::ConstraintViolation => "constraint_violation",
            ErrorKind::RunAlreadyInProgress => "run_already_in_progress",
            ErrorKind::RunCancelled => "run_cancelled",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Config => "config",
            ErrorKind::Migration => "migration",
        }
    }

    pub fn is_upstream(self) -> bool {
        matches!(
            self,
            ErrorKind::UpstreamUnavailable
                | ErrorKind::UpstreamRateLimited
                | ErrorKind::UpstreamTimeout
                | ErrorKind::UpstreamMalformedResponse
        )
    }

    pub fn is_storage(self) -> bool {
        matches!(
            self,
            ErrorKind::StorageUnavailable
                | ErrorKind::StorageTimeout
                | ErrorKind::ConstraintViolation
                | ErrorKind::Migration
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            Error::UpstreamRateLimited { .. } => ErrorKind::UpstreamRateLimited,
            Error::UpstreamTimeout(_) => ErrorKind::UpstreamTimeout,
            Error::UpstreamMalformedResponse(_) => ErrorKind::UpstreamMalformedResponse,
            Error::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            Error::StorageTimeout(_) => ErrorKind::StorageTimeout,
            Error::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            Error::RunAlreadyInProgress => ErrorKind::RunAlreadyInProgress,
            Error::RunCancelled => ErrorKind::RunCancelled,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Config(_) => ErrorKind::Config,
            Error::Migration(_) => ErrorKind::Migration,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::ConstraintViolation) => {
                Error::ConstraintViolation(e.to_string())
            }
            _ => Error::StorageUnavailable(e.to_string()),
        }
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    #[allow(unreachable_patterns)]
    fn from(e: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        match e {
            tokio_rusqlite::Error::Error(inner) => inner.into(),
            tokio_rusqlite::Error::Close((_, inner)) => inner.into(),
            other => Error::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    #[allow(unreachable_patterns)]
    fn from(e: tokio_rusqlite::Error<Error>) -> Self {
        match e {
            tokio_rusqlite::Error::Error(inner) => inner,
            tokio_rusqlite::Error::Close((_, inner)) => inner.into(),
            other => Error::StorageUnavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
