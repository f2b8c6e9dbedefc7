use super::messages::PollerMessage;
use crate::backend::BatchBackend;
use crate::config::PollConfig;
use crate::job::JobRecord;
use crate::retry::RetryConfig;
use crate::types::JobId;

use futures::future::join_all;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    select,
    sync::mpsc,
    time::{self, Instant},
};
use tracing::{debug, warn};

struct Watched {
    record: Arc<JobRecord>,
    waiters: usize,
}

pub struct Poller {
    inbox: mpsc::UnboundedReceiver<PollerMessage>,
    backend: Arc<dyn BatchBackend>,
    config: PollConfig,
    retry: RetryConfig,
    watched: HashMap<JobId, Watched>,
    interval: Duration,
    next_poll: Instant,
}

impl Poller {
    pub fn spawn(
        inbox: mpsc::UnboundedReceiver<PollerMessage>,
        backend: Arc<dyn BatchBackend>,
        config: PollConfig,
        retry: RetryConfig,
    ) {
        let actor = Self {
            inbox,
            backend,
            interval: config.initial_interval,
            next_poll: Instant::now(),
            config,
            retry,
            watched: HashMap::new(),
        };
        tokio::spawn(async move { actor.run().await });
    }

    async fn run(mut self) {
        loop {
            if self.watched.is_empty() {
                // idle until somebody blocks on a job
                match self.inbox.recv().await {
                    Some(msg) => self.handle(msg),
                    None => return,
                }
                continue;
            }
            select! {
                maybe_msg = self.inbox.recv() => {
                    match maybe_msg {
                        Some(msg) => self.handle(msg),
                        None => return,
                    }
                }
                _ = time::sleep_until(self.next_poll) => {
                    self.poll().await;
                }
            }
        }
    }

    fn handle(&mut self, msg: PollerMessage) {
        use self::PollerMessage::*;
        match msg {
            Watch { record } => {
                let job_id = record.id().clone();
                let was_idle = self.watched.is_empty();
                let watched = self.watched.entry(job_id.clone()).or_insert(Watched {
                    record,
                    waiters: 0,
                });
                watched.waiters += 1;
                if watched.waiters == 1 {
                    // a new job starts over at the fast cadence
                    self.interval = self.config.initial_interval;
                    let soon = Instant::now() + self.config.jittered(self.interval);
                    if was_idle || soon < self.next_poll {
                        self.next_poll = soon;
                    }
                    debug!(job_id = %job_id, watched = self.watched.len(), "Watching job");
                }
            }
            Unwatch { job_id } => {
                if let Some(watched) = self.watched.get_mut(&job_id) {
                    watched.waiters = watched.waiters.saturating_sub(1);
                    if watched.waiters == 0 {
                        self.watched.remove(&job_id);
                        debug!(job_id = %job_id, watched = self.watched.len(), "Stopped watching job");
                    }
                }
            }
        }
    }

    /// One tick: a single describe per watched, unfinished job.
    async fn poll(&mut self) {
        let due: Vec<Arc<JobRecord>> = self
            .watched
            .values()
            .map(|watched| watched.record.clone())
            .filter(|record| !record.is_settled())
            .collect();

        let backend = self.backend.as_ref();
        let retry = &self.retry;
        let outcomes = join_all(due.iter().map(|record| record.refresh(backend, retry))).await;

        let mut progressed = false;
        for (record, outcome) in due.iter().zip(outcomes) {
            match outcome {
                Ok(changed) => progressed |= changed,
                Err(err) => {
                    warn!(job_id = %record.id(), error = %err, "Giving up on status refresh");
                }
            }
        }

        self.interval = self.config.next_interval(self.interval, progressed);
        let delay = self.config.jittered(self.interval);
        self.next_poll = Instant::now() + delay;
        debug!(
            jobs = due.len(),
            progressed,
            next_poll_ms = delay.as_millis() as u64,
            "Poll tick"
        );
    }
}
