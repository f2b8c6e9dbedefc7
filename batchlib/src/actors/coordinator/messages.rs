use crate::backend::{BackendResult, StatusSnapshot};
use crate::spec::JobSpec;
use crate::types::{ArrayIndex, JobId, Payload};
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum CoordinatorMessage {
    SubmitArray {
        spec: Arc<JobSpec>,
        count: usize,
        response: oneshot::Sender<BackendResult<JobId>>,
    },
    Describe {
        job_id: JobId,
        response: oneshot::Sender<BackendResult<StatusSnapshot>>,
    },
    Terminate {
        job_id: JobId,
        reason: String,
        response: oneshot::Sender<BackendResult<()>>,
    },
    FetchResult {
        job_id: JobId,
        index: ArrayIndex,
        response: oneshot::Sender<BackendResult<Payload>>,
    },
}
