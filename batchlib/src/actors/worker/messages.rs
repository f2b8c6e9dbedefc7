use crate::types::{ArrayIndex, JobId, Payload};

pub enum WorkerMessage {
    Stop,
}

/// Progress of one array item, reported by its worker to the coordinator.
#[derive(Debug)]
pub struct ItemEvent {
    pub job_id: JobId,
    pub index: ArrayIndex,
    pub update: ItemUpdate,
}

#[derive(Debug)]
pub enum ItemUpdate {
    Starting,
    Running,
    /// The attempt failed and another one is queued.
    Retrying { reason: String },
    Succeeded { payload: Payload },
    Failed { reason: String },
}
