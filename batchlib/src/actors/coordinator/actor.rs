use super::messages::CoordinatorMessage;
use crate::actors::worker::messages::{ItemEvent, ItemUpdate};
use crate::actors::worker::{WorkerHandle, WorkerTask};
use crate::backend::{overall_status, BackendResult, IndexStatus, StatusSnapshot};
use crate::errors::BackendError;
use crate::local::{LocalConfig, Registry};
use crate::spec::JobSpec;
use crate::status::JobStatus;
use crate::types::{ArrayIndex, JobId, Payload};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    select,
    sync::{mpsc, oneshot, Semaphore},
    time::Instant,
};
use tracing::{debug, info};

struct LocalJob {
    items: Vec<IndexStatus>,
    results: Vec<Option<Payload>>,
    workers: Vec<WorkerHandle>,
    terminated: bool,
    finished_at: Option<Instant>,
}

impl LocalJob {
    fn snapshot(&self, job_id: &JobId) -> StatusSnapshot {
        let overall = overall_status(self.items.iter().map(|item| &item.status));
        StatusSnapshot::new(job_id.clone(), overall, self.items.clone())
    }

    fn all_terminal(&self) -> bool {
        self.items.iter().all(|item| item.status.is_terminal())
    }
}

pub struct Coordinator {
    inbox: mpsc::Receiver<CoordinatorMessage>,
    events: mpsc::UnboundedReceiver<ItemEvent>,
    events_tx: mpsc::UnboundedSender<ItemEvent>,
    registry: Registry,
    pool: Arc<Semaphore>,
    config: LocalConfig,
    jobs: HashMap<JobId, LocalJob>,
}

impl Coordinator {
    pub fn spawn(inbox: mpsc::Receiver<CoordinatorMessage>, registry: Registry, config: LocalConfig) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let actor = Self {
            inbox,
            events,
            events_tx,
            registry,
            pool: Arc::new(Semaphore::new(config.max_vcpus as usize)),
            config,
            jobs: HashMap::new(),
        };
        tokio::spawn(async move { actor.run().await });
    }

    async fn run(mut self) {
        use self::CoordinatorMessage::*;
        loop {
            select! {
                maybe_msg = self.inbox.recv() => {
                    let msg = match maybe_msg {
                        Some(msg) => msg,
                        // every handle dropped; workers stop with their handles
                        None => return,
                    };
                    match msg {
                        SubmitArray { spec, count, response } => {
                            self.evict_expired();
                            let _ = response.send(self.submit_array(spec, count));
                        }
                        Describe { job_id, response } => {
                            let _ = response.send(self.describe(&job_id));
                        }
                        Terminate { job_id, reason, response } => {
                            let _ = response.send(self.terminate(&job_id, &reason));
                        }
                        FetchResult { job_id, index, response } => {
                            self.fetch_result(&job_id, index, response);
                        }
                    }
                }
                Some(event) = self.events.recv() => {
                    self.apply(event);
                }
            }
        }
    }

    fn submit_array(&mut self, spec: Arc<JobSpec>, count: usize) -> BackendResult<JobId> {
        let callable = self
            .registry
            .get(spec.entry_point().as_str())
            .cloned()
            .ok_or_else(|| {
                BackendError::Rejected(format!("unknown entry point {}", spec.entry_point()))
            })?;
        if count == 0 || count != spec.array_size() {
            return Err(BackendError::Rejected(format!(
                "array size {} does not match the {} arguments of job {}",
                count,
                spec.array_size(),
                spec.name()
            )));
        }
        let resources = spec.resources();
        if resources.vcpus > self.config.max_vcpus {
            return Err(BackendError::Rejected(format!(
                "job {} requests {} vCPUs but the pool has {}",
                spec.name(),
                resources.vcpus,
                self.config.max_vcpus
            )));
        }
        if resources.memory_mib > self.config.max_memory_mib {
            return Err(BackendError::Rejected(format!(
                "job {} requests {} MiB but workers have {} MiB",
                spec.name(),
                resources.memory_mib,
                self.config.max_memory_mib
            )));
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let workers = (0..count)
            .map(|index| {
                WorkerHandle::spawn(WorkerTask {
                    job_id: job_id.clone(),
                    index,
                    spec: spec.clone(),
                    callable: callable.clone(),
                    pool: self.pool.clone(),
                    start_delay: self.config.start_delay,
                    events: self.events_tx.clone(),
                })
            })
            .collect();
        self.jobs.insert(
            job_id.clone(),
            LocalJob {
                items: vec![IndexStatus::new(JobStatus::Runnable); count],
                results: vec![None; count],
                workers,
                terminated: false,
                finished_at: None,
            },
        );
        info!(job_id = %job_id, name = spec.name(), count, "Local array job accepted");
        Ok(job_id)
    }

    fn describe(&self, job_id: &JobId) -> BackendResult<StatusSnapshot> {
        self.jobs
            .get(job_id)
            .map(|job| job.snapshot(job_id))
            .ok_or_else(|| BackendError::NotFound(job_id.clone()))
    }

    fn terminate(&mut self, job_id: &JobId, reason: &str) -> BackendResult<()> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| BackendError::NotFound(job_id.clone()))?;
        if job.terminated || job.all_terminal() {
            return Ok(());
        }
        job.workers.iter().for_each(WorkerHandle::stop);
        for item in job.items.iter_mut().filter(|item| !item.status.is_terminal()) {
            item.status = JobStatus::Failed;
            item.reason = Some(format!("terminated: {}", reason));
        }
        job.terminated = true;
        job.finished_at = Some(Instant::now());
        info!(job_id = %job_id, %reason, "Local array job terminated");
        Ok(())
    }

    fn fetch_result(
        &self,
        job_id: &JobId,
        index: ArrayIndex,
        response: oneshot::Sender<BackendResult<Payload>>,
    ) {
        let result = match self.jobs.get(job_id) {
            None => Err(BackendError::NotFound(job_id.clone())),
            Some(job) => match (job.items.get(index), job.results.get(index)) {
                (Some(_), Some(Some(payload))) => Ok(payload.clone()),
                (Some(item), _) => Err(BackendError::Rejected(format!(
                    "item {} of job {} has no result, it is {}",
                    index, job_id, item.status
                ))),
                (None, _) => Err(BackendError::Rejected(format!(
                    "job {} has no array index {}",
                    job_id, index
                ))),
            },
        };
        let _ = response.send(result);
    }

    fn apply(&mut self, event: ItemEvent) {
        let ItemEvent {
            job_id,
            index,
            update,
        } = event;
        let job = match self.jobs.get_mut(&job_id) {
            Some(job) => job,
            None => return,
        };
        let (item, result) = match (job.items.get_mut(index), job.results.get_mut(index)) {
            (Some(item), Some(result)) => (item, result),
            _ => return,
        };
        if item.status.is_terminal() {
            // late report from a terminated item
            return;
        }
        use ItemUpdate::*;
        match update {
            Starting => item.status = JobStatus::Starting,
            Running => item.status = JobStatus::Running,
            Retrying { reason } => {
                item.status = JobStatus::Runnable;
                item.attempts += 1;
                item.reason = Some(reason);
            }
            Succeeded { payload } => {
                item.status = JobStatus::Succeeded;
                item.attempts += 1;
                *result = Some(payload);
            }
            Failed { reason } => {
                item.status = JobStatus::Failed;
                item.attempts += 1;
                item.reason = Some(reason);
            }
        }
        debug!(job_id = %job_id, index, status = %item.status, attempts = item.attempts, "Item update");
        if job.finished_at.is_none() && job.all_terminal() {
            job.finished_at = Some(Instant::now());
        }
    }

    /// Forget jobs that finished longer than `retention` ago.
    fn evict_expired(&mut self) {
        let retention = self.config.retention;
        let before = self.jobs.len();
        self.jobs.retain(|_, job| match job.finished_at {
            Some(finished_at) => finished_at.elapsed() < retention,
            None => true,
        });
        let evicted = before - self.jobs.len();
        if evicted > 0 {
            debug!(evicted, "Evicted finished local jobs");
        }
    }
}
