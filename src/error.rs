//! Error types for taskq.

use thiserror::Error;

use crate::model::TaskState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("queue {0} has no waiting task")]
    EmptyQueue(crate::model::QueueId),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    /// Lost update on a conditional write. The engine retries claims that
    /// hit this; it never reaches a caller of `claim`.
    #[error("conflicting concurrent update: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("notification failed: {0}")]
    Notify(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the failure was caused by the request rather than the service.
    /// Bindings map these to the bad-request/not-found class.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::NotFound(_)
                | Error::Unauthorized
                | Error::EmptyQueue(_)
                | Error::InvalidTransition { .. }
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Notify(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
