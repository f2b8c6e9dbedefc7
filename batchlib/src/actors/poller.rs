mod actor;
mod messages;

use crate::backend::BatchBackend;
use crate::config::SessionConfig;
use crate::errors::{Error, Result};
use crate::job::JobRecord;
use crate::types::JobId;
use actor::Poller;
use messages::PollerMessage;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Handle to the single status poller of a session.
///
/// The poller only issues `describe` calls for jobs somebody is blocked on;
/// registration is tied to the lifetime of the returned [`Interest`].
#[derive(Clone)]
pub struct PollerHandle {
    sender: mpsc::UnboundedSender<PollerMessage>,
}

impl PollerHandle {
    pub fn spawn(backend: Arc<dyn BatchBackend>, config: &SessionConfig) -> Self {
        let (sender, inbox) = mpsc::unbounded_channel();
        Poller::spawn(inbox, backend, config.poll.clone(), config.describe_retry.clone());
        Self { sender }
    }

    pub fn watch(&self, record: Arc<JobRecord>) -> Result<Interest> {
        let job_id = record.id().clone();
        self.sender
            .send(PollerMessage::Watch { record })
            .map_err(|_| Error::BackendUnavailable("status poller exited".into()))?;
        Ok(Interest {
            job_id,
            sender: self.sender.clone(),
        })
    }
}

/// Keeps a job on the poller's watch list until dropped.
pub struct Interest {
    job_id: JobId,
    sender: mpsc::UnboundedSender<PollerMessage>,
}

impl Drop for Interest {
    fn drop(&mut self) {
        let _ = self.sender.send(PollerMessage::Unwatch {
            job_id: self.job_id.clone(),
        });
    }
}
