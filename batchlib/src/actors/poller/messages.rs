use crate::job::JobRecord;
use crate::types::JobId;
use std::sync::Arc;

pub enum PollerMessage {
    /// A waiter wants this job kept fresh.
    Watch { record: Arc<JobRecord> },
    /// A waiter is gone.
    Unwatch { job_id: JobId },
}
