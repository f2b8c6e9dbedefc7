mod actor;
pub mod messages;

use crate::local::Callable;
use crate::spec::JobSpec;
use crate::types::{ArrayIndex, JobId};
use actor::Actor;
use messages::{ItemEvent, WorkerMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

/// Everything a worker needs to run one array item to completion.
pub struct WorkerTask {
    pub job_id: JobId,
    pub index: ArrayIndex,
    pub spec: Arc<JobSpec>,
    pub callable: Callable,
    pub pool: Arc<Semaphore>,
    pub start_delay: Duration,
    pub events: mpsc::UnboundedSender<ItemEvent>,
}

/// Handle to the actor running one array item.
///
/// Dropping every clone of the handle stops the item, same as `stop`.
#[derive(Clone)]
pub struct WorkerHandle {
    sender: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerHandle {
    pub fn spawn(task: WorkerTask) -> Self {
        let (sender, inbox) = mpsc::unbounded_channel();
        Actor::spawn(inbox, task);
        Self { sender }
    }

    pub fn stop(&self) {
        let _ = self.sender.send(WorkerMessage::Stop);
    }
}
