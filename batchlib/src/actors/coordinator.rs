mod actor;
mod messages;

use self::{
    actor::Coordinator,
    messages::CoordinatorMessage::{self, Describe, FetchResult, SubmitArray, Terminate},
};
use crate::backend::{BackendResult, StatusSnapshot};
use crate::errors::BackendError;
use crate::local::{LocalConfig, Registry};
use crate::spec::JobSpec;
use crate::types::{ArrayIndex, JobId, Payload};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Handle to the actor that owns every job of a [`LocalBackend`](crate::local::LocalBackend).
///
/// The handle can be cloned freely; all state lives in the actor spawned by
/// `CoordinatorHandle::spawn`, which exits once every handle is dropped.
#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<CoordinatorMessage>,
}

impl CoordinatorHandle {
    /// Spawn a new coordinator.
    ///
    /// `message_capacity` bounds the coordinator's inbound queue.
    pub fn spawn(message_capacity: usize, registry: Registry, config: LocalConfig) -> Self {
        let (sender, receiver) = mpsc::channel(message_capacity.max(1));
        Coordinator::spawn(receiver, registry, config);
        Self { sender }
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<BackendResult<T>>) -> CoordinatorMessage,
    ) -> BackendResult<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(message(tx))
            .await
            .map_err(|_| coordinator_gone())?;
        rx.await.map_err(|_| coordinator_gone())?
    }

    pub async fn submit_array(&self, spec: Arc<JobSpec>, count: usize) -> BackendResult<JobId> {
        self.request(|response| SubmitArray {
            spec,
            count,
            response,
        })
        .await
    }

    pub async fn describe(&self, job_id: JobId) -> BackendResult<StatusSnapshot> {
        self.request(|response| Describe { job_id, response }).await
    }

    pub async fn terminate(&self, job_id: JobId, reason: String) -> BackendResult<()> {
        self.request(|response| Terminate {
            job_id,
            reason,
            response,
        })
        .await
    }

    pub async fn fetch_result(&self, job_id: JobId, index: ArrayIndex) -> BackendResult<Payload> {
        self.request(|response| FetchResult {
            job_id,
            index,
            response,
        })
        .await
    }
}

fn coordinator_gone() -> BackendError {
    BackendError::Unavailable("local coordinator exited".into())
}
