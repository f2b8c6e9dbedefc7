use crate::errors::{Error, ItemFailure, Result};
use crate::job::{
    cancelled, deadline_after, decode_all, item_outcome, wait_settled, JobHandle, Outcome,
    StatusReport, Termination,
};
use crate::status::ItemState;
use crate::types::{ArrayIndex, Payload};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Copy, Debug)]
struct Slot {
    job: usize,
    index: ArrayIndex,
}

/// Future over the results of one `map` call, possibly spanning several
/// array jobs. Results come back in input order.
#[derive(Clone)]
pub struct MapFuture {
    jobs: Vec<JobHandle>,
    slots: Vec<Slot>,
}

impl MapFuture {
    /// Slots are laid out job by job, in the order the jobs are given.
    pub(crate) fn new(jobs: Vec<JobHandle>) -> Self {
        let slots = jobs
            .iter()
            .enumerate()
            .flat_map(|(job, handle)| (0..handle.array_size()).map(move |index| Slot { job, index }))
            .collect();
        Self { jobs, slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn jobs(&self) -> &[JobHandle] {
        &self.jobs
    }

    /// Whether every item finished. Member jobs whose cached state is older
    /// than the session's staleness bound are queried first; never fails.
    pub async fn done(&self) -> bool {
        join_all(self.jobs.iter().map(JobHandle::done))
            .await
            .into_iter()
            .all(|done| done)
    }

    /// Non-blocking `done`, from the cached state only.
    pub fn is_done(&self) -> bool {
        self.jobs.iter().all(JobHandle::is_done)
    }

    /// Query the backend for every member job now.
    pub async fn refresh(&self) -> Result<()> {
        let refreshed = join_all(self.jobs.iter().map(JobHandle::refresh)).await;
        for outcome in refreshed {
            outcome?;
        }
        Ok(())
    }

    pub async fn status(&self) -> Vec<StatusReport> {
        join_all(self.jobs.iter().map(JobHandle::status)).await
    }

    fn slot(&self, position: usize) -> Result<(&JobHandle, ArrayIndex)> {
        let slot = self.slots.get(position).ok_or(Error::IndexOutOfRange {
            index: position,
            size: self.len(),
        })?;
        Ok((&self.jobs[slot.job], slot.index))
    }

    /// State of the item at input `position`.
    pub fn item(&self, position: usize) -> Result<ItemState> {
        let (job, index) = self.slot(position)?;
        job.item(index)
    }

    pub fn item_result<T: DeserializeOwned>(&self, position: usize) -> Result<Outcome<T>> {
        let (job, index) = self.slot(position)?;
        let state = job.item(index)?;
        item_outcome(job, index, position, state)
    }

    pub async fn wait(&self, timeout: Option<Duration>) -> Result<Outcome<Vec<Payload>>> {
        let deadline = deadline_after(timeout);
        let jobs: Vec<&JobHandle> = self.jobs.iter().collect();
        if let Outcome::NotReady = wait_settled(&jobs, deadline).await? {
            return Ok(Outcome::NotReady);
        }
        self.collect().map(Outcome::Ready)
    }

    pub async fn result<T: DeserializeOwned>(&self, timeout: Option<Duration>) -> Result<Vec<T>> {
        match self.wait(timeout).await? {
            Outcome::Ready(payloads) => decode_all(payloads),
            Outcome::NotReady => Err(Error::Timeout {
                job_id: self
                    .jobs
                    .iter()
                    .map(|job| job.id().as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            }),
        }
    }

    fn collect(&self) -> Result<Vec<Payload>> {
        for job in &self.jobs {
            if let Some(cancellation) = job.snapshot().cancellation {
                return Err(cancelled(job.id(), &cancellation));
            }
        }
        let mut payloads = Vec::with_capacity(self.len());
        let mut failures = Vec::new();
        for (position, slot) in self.slots.iter().enumerate() {
            let job = &self.jobs[slot.job];
            match job.item(slot.index)? {
                ItemState::Succeeded(payload) => payloads.push(payload),
                ItemState::Failed(reason) => failures.push(ItemFailure {
                    job_id: job.id().clone(),
                    index: position,
                    reason,
                }),
                ItemState::Cancelled => {
                    return Err(Error::Cancelled {
                        job_id: job.id().clone(),
                        remote_confirmed: false,
                    })
                }
                ItemState::Pending | ItemState::Running => {}
            }
        }
        if failures.is_empty() {
            return Ok(payloads);
        }
        debug!(failed = failures.len(), total = self.len(), "Map finished with failures");
        match self.jobs.as_slice() {
            [job] if failures.len() == self.len() => Err(Error::RemoteJob {
                job_id: job.id().clone(),
                failures,
            }),
            _ => Err(Error::PartialFailure {
                failures,
                total: self.len(),
            }),
        }
    }

    /// Terminate every member job. Reports the weakest outcome among them.
    pub async fn terminate(&self, reason: &str) -> Result<Termination> {
        let outcomes = join_all(self.jobs.iter().map(|job| job.terminate(reason))).await;
        let mut combined = Termination::AlreadyFinished;
        for outcome in outcomes {
            match outcome? {
                Termination::AlreadyFinished => {}
                Termination::Terminated => {
                    if combined == Termination::AlreadyFinished {
                        combined = Termination::Terminated;
                    }
                }
                local @ Termination::LocalOnly { .. } => {
                    if !matches!(combined, Termination::LocalOnly { .. }) {
                        combined = local;
                    }
                }
            }
        }
        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::spec::ResourceRequest;
    use crate::testing::fixtures;

    #[tokio::test(start_paused = true)]
    async fn results_follow_input_order() {
        let backend = fixtures::backend();
        let session = fixtures::session(&backend);
        // later inputs finish first
        let inputs: Vec<u64> = vec![5000, 4000, 3000, 2000, 1000, 0];
        let future = session.map("sleepy", inputs.clone(), vec![]).await.unwrap();
        assert_eq!(future.len(), 6);
        let results: Vec<u64> = future.result(None).await.unwrap();
        assert_eq!(results, inputs);
        assert!(future.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn partial_failure_keeps_successes_retrievable() {
        let backend = fixtures::backend();
        let session = fixtures::session(&backend);
        let future = session.map("odd_fails", 0..5u32, vec![]).await.unwrap();

        match future.result::<u32>(None).await {
            Err(Error::PartialFailure { failures, total }) => {
                assert_eq!(total, 5);
                let failed: Vec<usize> = failures.iter().map(|f| f.index).collect();
                assert_eq!(failed, vec![1, 3]);
                assert_eq!(failures[1].reason, "3 is odd");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        for position in [0, 2, 4] {
            assert_eq!(
                future.item_result::<u32>(position).unwrap(),
                Outcome::Ready(position as u32)
            );
        }
        assert!(matches!(future.item(1).unwrap(), ItemState::Failed(_)));
        assert!(future.item_result::<u32>(3).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn single_job_failing_everywhere_is_a_remote_failure() {
        let backend = fixtures::backend();
        let session = fixtures::session(&backend);
        let future = session.map("odd_fails", vec![1u32, 3], vec![]).await.unwrap();
        assert!(matches!(
            future.result::<u32>(None).await,
            Err(Error::RemoteJob { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn large_maps_are_chunked_and_polled_per_job() {
        let backend = fixtures::backend();
        let session = fixtures::session_with(
            &backend,
            SessionConfig::default().with_max_array_size(4),
        );
        let inputs: Vec<f64> = (0..10).map(f64::from).collect();
        let future = session
            .map_with("square", inputs.clone(), ResourceRequest::new(128, 1, 1), vec![])
            .await
            .unwrap();
        assert_eq!(future.jobs().len(), 3);
        assert_eq!(future.len(), 10);
        let sizes: Vec<usize> = future.jobs().iter().map(JobHandle::array_size).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(future.jobs()[2].name(), "square-2");

        let results: Vec<f64> = future.result(None).await.unwrap();
        let expected: Vec<f64> = inputs.iter().map(|x| x * x).collect();
        assert_eq!(results, expected);

        // everything finished before the first tick: one describe per job
        for job in future.jobs() {
            assert_eq!(backend.describe_calls(job.id()), 1);
        }
        assert_eq!(backend.fetch_calls(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_chunk_submission_terminates_siblings() {
        let backend = fixtures::backend();
        let session = fixtures::session_with(
            &backend,
            SessionConfig::default().with_max_array_size(2),
        );
        backend.allow_submits(1);
        let err = session.map("hang", 0..5u32, vec![]).await.err().unwrap();
        assert!(matches!(err, Error::BackendRejected(_)), "{}", err);
        assert_eq!(backend.submit_calls(), 2);
        assert_eq!(backend.terminate_calls(), 1);
        let jobs = session.jobs();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].report().cancellation.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_cancels_every_member() {
        let backend = fixtures::backend();
        let session = fixtures::session_with(
            &backend,
            SessionConfig::default().with_max_array_size(2),
        );
        let future = session.map("hang", 0..3u32, vec![]).await.unwrap();
        assert!(!future.is_done());
        assert_eq!(future.terminate("enough").await.unwrap(), Termination::Terminated);
        assert!(future.is_done());
        assert!(matches!(
            future.result::<u32>(Some(Duration::from_secs(1))).await,
            Err(Error::Cancelled { .. })
        ));
        assert_eq!(backend.terminate_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_and_status_cover_every_job() {
        let backend = fixtures::backend();
        let session = fixtures::session_with(
            &backend,
            SessionConfig::default().with_max_array_size(2),
        );
        let future = session.map("square", vec![1.0, 2.0, 3.0], vec![]).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        future.refresh().await.unwrap();
        assert!(future.is_done());
        let reports = future.status().await;
        assert_eq!(reports.len(), 2);
        assert!(matches!(
            future.item(7),
            Err(Error::IndexOutOfRange { index: 7, size: 3 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn done_catches_up_without_a_waiter() {
        let backend = fixtures::backend();
        let bound = Duration::from_millis(500);
        let session = fixtures::session_with(
            &backend,
            SessionConfig::default()
                .with_max_array_size(2)
                .with_staleness_bound(bound),
        );
        let future = session.map("square", vec![1.0, 2.0, 3.0], vec![]).await.unwrap();
        assert!(!future.done().await);
        let describes = backend.total_describe_calls();

        // within the bound the cached answer is reused
        assert!(!future.done().await);
        assert_eq!(backend.total_describe_calls(), describes);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!future.is_done());
        assert!(future.done().await);
        assert!(future.is_done());
        assert_eq!(backend.total_describe_calls(), describes + 2);

        // a true answer is final: no more queries
        assert!(future.done().await);
        assert_eq!(backend.total_describe_calls(), describes + 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_timeout_waits_without_a_deadline() {
        let backend = fixtures::backend();
        let session = fixtures::session(&backend);
        let future = session.map("square", vec![1.5, 2.0], vec![]).await.unwrap();
        let results: Vec<f64> = future.result(Some(Duration::MAX)).await.unwrap();
        assert_eq!(results, vec![2.25, 4.0]);
    }
}
