//! Job execution error types
//!
//! A failed `process` call is terminal for that job; the queue never retries on its
//! own. The `retryable` flag is stored with the failure so an operator (or the caller
//! that enqueued the job) can tell whether `retry_failed` is worth calling.

use std::fmt;

#[derive(Debug)]
pub struct JobError {
    inner: anyhow::Error,
    retryable: bool,
}

impl JobError {
    /// A failure that a later attempt on the same payload cannot fix
    /// (missing record, unsupported input, bad payload).
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            retryable: false,
        }
    }

    /// A failure that may go away on a re-enqueue (encoder crashed, disk full).
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            retryable: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.inner
    }

    /// Shape persisted in the job's `error` column.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "message": format!("{:#}", self.inner),
            "retryable": self.retryable,
        })
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::transient(err)
    }
}

impl From<crate::AppError> for JobError {
    fn from(err: crate::AppError) -> Self {
        match err {
            crate::AppError::NotFound(_) | crate::AppError::Validation(_) => {
                Self::permanent(err)
            }
            other => Self::transient(other),
        }
    }
}

/// Extension trait for Result to mark errors as permanent job failures
pub trait JobResultExt<T> {
    fn permanent(self) -> Result<T, JobError>;
}

impl<T, E: Into<anyhow::Error>> JobResultExt<T> for Result<T, E> {
    fn permanent(self) -> Result<T, JobError> {
        self.map_err(|e| JobError::permanent(e.into()))
    }
}
