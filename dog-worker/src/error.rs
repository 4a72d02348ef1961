use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

/// Result type for worker and processor operations
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Boxed error type accepted as the cause of a job failure
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Infrastructure and validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("job is not valid: {0}")]
    InvalidJob(String),

    #[error("job handler is not valid: {0}")]
    InvalidJobHandler(String),

    #[error("handler for given job type exists: type '{0}'")]
    TypeExists(String),

    #[error("job type is invalid: type '{0}'")]
    UnknownType(String),

    #[error("job with id exists: {0}")]
    JobExists(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("invalid job id: {0}")]
    InvalidJobId(String),

    #[error("job executor panicked: {0}")]
    ExecutorPanic(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for WorkerError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                WorkerError::JobExists(db.message().to_string())
            }
            _ => WorkerError::Store(err.to_string()),
        }
    }
}

/// Marks a handler failure as eligible for another attempt.
///
/// Any other error returned from a handler is fatal for the job.
#[derive(Debug)]
pub struct RetryableError {
    cause: BoxError,
}

impl RetryableError {
    pub fn new(cause: impl Into<BoxError>) -> Self {
        Self { cause: cause.into() }
    }

    /// The wrapped failure
    pub fn cause(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.cause.as_ref()
    }
}

impl fmt::Display for RetryableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "retryable-error: {}", self.cause)
    }
}

impl StdError for RetryableError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.cause.as_ref())
    }
}

/// Job execution outcome - determines retry behavior
#[derive(Error, Debug)]
pub enum JobError {
    /// Retryable error - will schedule retry if attempts remain
    #[error(transparent)]
    Retryable(#[from] RetryableError),

    /// Permanent error - the job is moved to the dead set
    #[error("{0}")]
    Permanent(BoxError),
}

impl JobError {
    /// Create a retryable error
    pub fn retryable(cause: impl Into<BoxError>) -> Self {
        Self::Retryable(RetryableError::new(cause))
    }

    /// Create a permanent error
    pub fn permanent(cause: impl Into<BoxError>) -> Self {
        Self::Permanent(cause.into())
    }

    /// Check if this error is retryable.
    ///
    /// A permanent error is still retryable when a [`RetryableError`] appears
    /// anywhere in its source chain.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Retryable(_) => true,
            Self::Permanent(cause) => {
                std::iter::successors(Some(cause.as_ref() as &(dyn StdError + 'static)), |e| (*e).source())
                    .any(|e| e.is::<RetryableError>())
            }
        }
    }
}
