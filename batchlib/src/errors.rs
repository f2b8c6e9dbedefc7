use crate::types::{ArrayIndex, JobId};
use std::{fmt, result};
use thiserror::Error;

/// One failed array item, as reported back to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemFailure {
    pub job_id: JobId,
    /// Array index for single jobs, input position for maps.
    pub index: ArrayIndex,
    pub reason: String,
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.index, self.reason)
    }
}

fn list_failures(failures: &[ItemFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),
    #[error("batch backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("batch backend rejected the request: {0}")]
    BackendRejected(String),
    #[error("no such job: {0}")]
    NotFound(JobId),
    #[error("the job with job-id {job_id} did not finish within the requested timeout period")]
    Timeout { job_id: JobId },
    #[error("batch job {job_id} has failed: {}", list_failures(.failures))]
    RemoteJob {
        job_id: JobId,
        failures: Vec<ItemFailure>,
    },
    #[error("{} of {} items failed: {}", .failures.len(), .total, list_failures(.failures))]
    PartialFailure {
        failures: Vec<ItemFailure>,
        total: usize,
    },
    #[error("job {job_id} was cancelled")]
    Cancelled {
        job_id: JobId,
        /// false when the backend could not confirm the remote terminate.
        remote_confirmed: bool,
    },
    #[error("job {0} has been clobbered")]
    Clobbered(JobId),
    #[error("result of item {index} could not be decoded: {source}")]
    Decode {
        index: ArrayIndex,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode argument: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("index {index} is out of range for {size} items")]
    IndexOutOfRange { index: ArrayIndex, size: usize },
}

impl Error {
    /// A timeout only means the deadline passed; the job may still finish.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

/// Errors a [`BatchBackend`](crate::backend::BatchBackend) implementation reports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Transient: connectivity loss, throttling, actor gone.
    #[error("{0}")]
    Unavailable(String),
    #[error("no such job: {0}")]
    NotFound(JobId),
    #[error("{0}")]
    Rejected(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(msg) => Error::BackendUnavailable(msg),
            BackendError::NotFound(job_id) => Error::NotFound(job_id),
            BackendError::Rejected(msg) => Error::BackendRejected(msg),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_map_onto_the_taxonomy() {
        let err: Error = BackendError::Unavailable("connection reset".into()).into();
        assert!(matches!(err, Error::BackendUnavailable(msg) if msg == "connection reset"));

        let err: Error = BackendError::NotFound("job-1".into()).into();
        assert!(matches!(err, Error::NotFound(id) if id == "job-1"));

        assert!(BackendError::Unavailable(String::new()).is_transient());
        assert!(!BackendError::Rejected(String::new()).is_transient());
    }

    #[test]
    fn partial_failure_lists_indices() {
        let err = Error::PartialFailure {
            failures: vec![
                ItemFailure {
                    job_id: "a".into(),
                    index: 1,
                    reason: "boom".into(),
                },
                ItemFailure {
                    job_id: "a".into(),
                    index: 3,
                    reason: "bust".into(),
                },
            ],
            total: 5,
        };
        assert_eq!(err.to_string(), "2 of 5 items failed: [1] boom, [3] bust");
    }

    #[test]
    fn timeout_message_carries_job_id() {
        let err = Error::Timeout {
            job_id: "abc".into(),
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("abc"));
    }
}
