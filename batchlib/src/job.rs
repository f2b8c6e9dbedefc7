//! Handles to submitted array jobs.
//!
//! A [`JobHandle`] is cheap to clone. All clones share one [`JobRecord`], whose
//! state lives in a `watch` channel: refreshes (from the session's poller or
//! from on-demand `status` calls) write to it, blocked waiters subscribe to it.

use crate::backend::{BackendResult, BatchBackend};
use crate::config::SessionConfig;
use crate::errors::{BackendError, Error, ItemFailure, Result};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::spec::JobSpec;
use crate::status::{ItemState, ItemTracker, JobStatus, StatusSummary};
use crate::types::{ArrayIndex, JobId, Payload};
use crate::actors::poller::PollerHandle;
use chrono::{DateTime, Utc};
use futures::future::{join_all, select_all};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

/// Either the value, or "not finished yet". Returned instead of an error
/// when a deadline passes, so callers can simply wait again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Ready(T),
    NotReady,
}

impl<T> Outcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Outcome::Ready(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Outcome::Ready(value) => Some(value),
            Outcome::NotReady => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Ready(value) => Outcome::Ready(f(value)),
            Outcome::NotReady => Outcome::NotReady,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteTermination {
    Pending,
    Confirmed,
    /// The backend could not be told; the job may still be running remotely.
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cancellation {
    pub reason: String,
    pub remote: RemoteTermination,
}

/// What `terminate` did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    /// Every item had already finished; nothing was cancelled.
    AlreadyFinished,
    Terminated,
    /// Cancelled locally, but the backend did not confirm.
    LocalOnly { error: String },
}

#[derive(Clone, Debug)]
pub struct JobState {
    pub overall: JobStatus,
    pub items: Vec<ItemTracker>,
    pub last_refreshed: Option<Instant>,
    /// Set when the last refresh gave up; cleared by the next good one.
    pub unavailable: Option<String>,
    pub cancellation: Option<Cancellation>,
    pub clobbered: bool,
}

impl JobState {
    fn new(array_size: usize) -> Self {
        Self {
            overall: JobStatus::Submitted,
            items: vec![ItemTracker::default(); array_size],
            last_refreshed: None,
            unavailable: None,
            cancellation: None,
            clobbered: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.items.iter().all(ItemTracker::is_terminal)
    }

    pub fn summary(&self) -> StatusSummary {
        self.items.iter().map(ItemTracker::status).collect()
    }
}

/// Point-in-time view of a job for display.
#[derive(Clone, Debug)]
pub struct StatusReport {
    pub job_id: JobId,
    pub name: String,
    pub overall: JobStatus,
    pub summary: StatusSummary,
    /// Why the status may be stale, if the backend could not be reached.
    pub degraded: Option<String>,
    pub cancellation: Option<Cancellation>,
    pub clobbered: bool,
}

pub struct JobRecord {
    id: JobId,
    name: String,
    submitted_at: DateTime<Utc>,
    array_size: usize,
    state: watch::Sender<JobState>,
    terminate_lock: Mutex<()>,
}

impl JobRecord {
    pub(crate) fn new(id: JobId, spec: &JobSpec) -> Self {
        let (state, _) = watch::channel(JobState::new(spec.array_size()));
        Self {
            id,
            name: spec.name().to_string(),
            submitted_at: Utc::now(),
            array_size: spec.array_size(),
            state,
            terminate_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub(crate) fn snapshot(&self) -> JobState {
        self.state.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    /// Nothing left to learn from the backend.
    pub(crate) fn is_settled(&self) -> bool {
        let state = self.state.borrow();
        state.clobbered || state.is_done()
    }

    fn mark_unavailable(&self, err: &BackendError) {
        let reason = err.to_string();
        self.state.send_modify(|state| state.unavailable = Some(reason));
    }

    pub(crate) fn clear_unavailable(&self) {
        self.state
            .send_if_modified(|state| state.unavailable.take().is_some());
    }

    /// Describe the job once (with transient retries), fetch the results of
    /// items that newly succeeded and fold both into the shared state.
    ///
    /// Returns whether anything changed.
    pub(crate) async fn refresh(
        &self,
        backend: &dyn BatchBackend,
        retry: &RetryConfig,
    ) -> BackendResult<bool> {
        if self.is_settled() {
            return Ok(false);
        }
        let snapshot = retry_with_backoff(retry, "describe", BackendError::is_transient, || {
            backend.describe(&self.id)
        })
        .await;
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.mark_unavailable(&err);
                return Err(err);
            }
        };

        let newly_succeeded: Vec<ArrayIndex> = {
            let state = self.state.borrow();
            snapshot
                .items
                .iter()
                .enumerate()
                .filter(|(index, item)| {
                    item.status == JobStatus::Succeeded
                        && state
                            .items
                            .get(*index)
                            .map_or(false, |tracker| !tracker.is_terminal())
                })
                .map(|(index, _)| index)
                .collect()
        };
        let fetched = join_all(newly_succeeded.into_iter().map(|index| async move {
            let payload =
                retry_with_backoff(retry, "fetch_result", BackendError::is_transient, || {
                    backend.fetch_result(&self.id, index)
                })
                .await;
            (index, payload)
        }))
        .await;

        let mut fetch_error = None;
        let changed = self.state.send_if_modified(|state| {
            let mut changed = false;
            for (index, item) in snapshot.items.iter().enumerate() {
                if item.status == JobStatus::Succeeded {
                    continue;
                }
                if let Some(tracker) = state.items.get_mut(index) {
                    changed |= tracker
                        .observe(item.status, item.attempts, item.reason.clone())
                        .changed();
                }
            }
            for (index, payload) in fetched {
                match payload {
                    Ok(payload) => {
                        let attempts = snapshot.items[index].attempts;
                        changed |= state.items[index].succeed(payload, attempts).changed();
                    }
                    Err(err) => fetch_error = Some(err),
                }
            }
            // a terminal overall status waits for every result to be in
            let settled = !snapshot.overall.is_terminal() || state.is_done();
            if settled && snapshot.overall.rank() > state.overall.rank() {
                state.overall = snapshot.overall;
                changed = true;
            }
            state.last_refreshed = Some(Instant::now());
            if fetch_error.is_none() && state.unavailable.take().is_some() {
                changed = true;
            }
            changed
        });

        if let Some(err) = fetch_error {
            self.mark_unavailable(&err);
            return Err(err);
        }
        if changed {
            debug!(job_id = %self.id, "Job state changed");
        }
        Ok(changed)
    }
}

/// Shared by every handle of one session.
pub(crate) struct SessionShared {
    pub backend: Arc<dyn BatchBackend>,
    pub poller: PollerHandle,
    pub config: SessionConfig,
}

/// One submitted array job.
#[derive(Clone)]
pub struct JobHandle {
    record: Arc<JobRecord>,
    shared: Arc<SessionShared>,
}

impl JobHandle {
    pub(crate) fn new(record: JobRecord, shared: Arc<SessionShared>) -> Self {
        Self {
            record: Arc::new(record),
            shared,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.record.submitted_at
    }

    pub fn array_size(&self) -> usize {
        self.record.array_size
    }

    /// The cached state, without querying the backend.
    pub fn snapshot(&self) -> JobState {
        self.record.snapshot()
    }

    pub fn is_clobbered(&self) -> bool {
        self.record.state.borrow().clobbered
    }

    /// Query the backend now and report. Never fails: when the backend cannot
    /// be reached the last known status comes back with `degraded` set.
    pub async fn status(&self) -> StatusReport {
        if !self.is_clobbered() {
            if let Err(err) = self.refresh().await {
                debug!(job_id = %self.id(), error = %err, "Status refresh failed");
            }
        }
        self.report()
    }

    /// The cached status, without querying the backend.
    pub fn report(&self) -> StatusReport {
        let state = self.record.state.borrow();
        StatusReport {
            job_id: self.id().clone(),
            name: self.name().to_string(),
            overall: state.overall,
            summary: state.summary(),
            degraded: state.unavailable.clone(),
            cancellation: state.cancellation.clone(),
            clobbered: state.clobbered,
        }
    }

    pub(crate) async fn refresh(&self) -> BackendResult<bool> {
        self.record
            .refresh(self.shared.backend.as_ref(), &self.shared.config.describe_retry)
            .await
    }

    /// True once every item reached a terminal state.
    ///
    /// Queries the backend first when the cached state is older than the
    /// session's staleness bound. A `true` answer never goes stale.
    pub async fn done(&self) -> bool {
        let stale = {
            let state = self.record.state.borrow();
            !state.is_done()
                && !state.clobbered
                && state
                    .last_refreshed
                    .map_or(true, |at| at.elapsed() >= self.shared.config.staleness_bound)
        };
        if stale {
            let _ = self.refresh().await;
        }
        self.is_done()
    }

    /// Non-blocking `done`, from the cached state only.
    pub fn is_done(&self) -> bool {
        self.record.state.borrow().is_done()
    }

    pub fn item(&self, index: ArrayIndex) -> Result<ItemState> {
        let state = self.record.state.borrow();
        state
            .items
            .get(index)
            .map(ItemTracker::state)
            .ok_or(Error::IndexOutOfRange {
                index,
                size: self.array_size(),
            })
    }

    /// Decoded result of one item, if it has finished successfully.
    pub fn item_result<T: DeserializeOwned>(&self, index: ArrayIndex) -> Result<Outcome<T>> {
        let state = self.item(index)?;
        item_outcome(self, index, index, state)
    }

    /// Block until every item finished or `timeout` elapsed (`None` waits
    /// forever). Payloads come back in index order.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<Outcome<Vec<Payload>>> {
        let deadline = deadline_after(timeout);
        if let Outcome::NotReady = wait_settled(&[self], deadline).await? {
            return Ok(Outcome::NotReady);
        }
        self.collect().map(Outcome::Ready)
    }

    /// Like [`JobHandle::wait`] but decodes the results and reports a passed
    /// deadline as [`Error::Timeout`].
    pub async fn result<T: DeserializeOwned>(&self, timeout: Option<Duration>) -> Result<Vec<T>> {
        match self.wait(timeout).await? {
            Outcome::Ready(payloads) => decode_all(payloads),
            Outcome::NotReady => Err(Error::Timeout {
                job_id: self.id().clone(),
            }),
        }
    }

    fn collect(&self) -> Result<Vec<Payload>> {
        let state = self.record.state.borrow();
        if let Some(cancellation) = &state.cancellation {
            return Err(cancelled(self.id(), cancellation));
        }
        let mut payloads = Vec::with_capacity(state.items.len());
        let mut failures = Vec::new();
        for (index, tracker) in state.items.iter().enumerate() {
            match tracker.state() {
                ItemState::Succeeded(payload) => payloads.push(payload),
                ItemState::Failed(reason) => failures.push(ItemFailure {
                    job_id: self.id().clone(),
                    index,
                    reason,
                }),
                ItemState::Cancelled => {
                    return Err(Error::Cancelled {
                        job_id: self.id().clone(),
                        remote_confirmed: false,
                    })
                }
                ItemState::Pending | ItemState::Running => {}
            }
        }
        if !failures.is_empty() {
            return Err(Error::RemoteJob {
                job_id: self.id().clone(),
                failures,
            });
        }
        Ok(payloads)
    }

    /// Cancel every unfinished item and ask the backend to terminate the job.
    ///
    /// Local cancellation always takes effect and wakes blocked waiters. If
    /// the backend cannot be reached the result is
    /// [`Termination::LocalOnly`]: the job may still be running remotely.
    /// Calling this again after a confirmed termination does nothing.
    pub async fn terminate(&self, reason: &str) -> Result<Termination> {
        let _guard = self.record.terminate_lock.lock().await;
        let previous = {
            let state = self.record.state.borrow();
            if state.clobbered {
                return Err(Error::Clobbered(self.id().clone()));
            }
            state.cancellation.clone()
        };
        match previous {
            Some(Cancellation {
                remote: RemoteTermination::Confirmed,
                ..
            }) => return Ok(Termination::Terminated),
            // retry the remote half below
            Some(_) => {}
            None => {
                let cancelled_now = self.record.state.send_if_modified(|state| {
                    if state.is_done() {
                        return false;
                    }
                    for item in state.items.iter_mut() {
                        item.cancel(reason);
                    }
                    state.overall = JobStatus::Cancelled;
                    state.cancellation = Some(Cancellation {
                        reason: reason.to_string(),
                        remote: RemoteTermination::Pending,
                    });
                    true
                });
                if !cancelled_now {
                    return Ok(Termination::AlreadyFinished);
                }
            }
        }

        let backend = self.shared.backend.as_ref();
        let outcome = retry_with_backoff(
            &self.shared.config.describe_retry,
            "terminate",
            BackendError::is_transient,
            || backend.terminate(self.id(), reason),
        )
        .await;
        let (remote, termination) = match outcome {
            // a job the backend forgot is as terminated as it gets
            Ok(()) | Err(BackendError::NotFound(_)) => {
                info!(job_id = %self.id(), %reason, "Job terminated");
                (RemoteTermination::Confirmed, Termination::Terminated)
            }
            Err(err) => {
                warn!(job_id = %self.id(), error = %err, "Job cancelled locally but the backend did not confirm termination");
                (
                    RemoteTermination::Failed(err.to_string()),
                    Termination::LocalOnly {
                        error: err.to_string(),
                    },
                )
            }
        };
        self.record.state.send_modify(|state| {
            if let Some(cancellation) = state.cancellation.as_mut() {
                cancellation.remote = remote;
            }
        });
        Ok(termination)
    }

    pub(crate) fn clobber(&self) {
        self.record.state.send_modify(|state| state.clobbered = true);
    }
}

/// `None` waits forever, as does a timeout too large to represent.
pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|timeout| Instant::now().checked_add(timeout))
}

pub(crate) fn cancelled(job_id: &JobId, cancellation: &Cancellation) -> Error {
    Error::Cancelled {
        job_id: job_id.clone(),
        remote_confirmed: cancellation.remote == RemoteTermination::Confirmed,
    }
}

pub(crate) fn decode<T: DeserializeOwned>(index: ArrayIndex, payload: &Payload) -> Result<T> {
    serde_json::from_slice(payload).map_err(|source| Error::Decode { index, source })
}

pub(crate) fn decode_all<T: DeserializeOwned>(payloads: Vec<Payload>) -> Result<Vec<T>> {
    payloads
        .iter()
        .enumerate()
        .map(|(index, payload)| decode(index, payload))
        .collect()
}

/// Turn one item's state into an [`Outcome`]; `position` is what the caller
/// calls the item (its input position for maps).
pub(crate) fn item_outcome<T: DeserializeOwned>(
    handle: &JobHandle,
    index: ArrayIndex,
    position: usize,
    state: ItemState,
) -> Result<Outcome<T>> {
    match state {
        ItemState::Succeeded(payload) => decode(position, &payload).map(Outcome::Ready),
        ItemState::Pending | ItemState::Running => Ok(Outcome::NotReady),
        ItemState::Failed(reason) => Err(Error::RemoteJob {
            job_id: handle.id().clone(),
            failures: vec![ItemFailure {
                job_id: handle.id().clone(),
                index: position,
                reason,
            }],
        }),
        ItemState::Cancelled => {
            let state = handle.record.state.borrow();
            debug!(job_id = %handle.id(), index, "Item was cancelled");
            Err(match &state.cancellation {
                Some(cancellation) => cancelled(handle.id(), cancellation),
                None => Error::Cancelled {
                    job_id: handle.id().clone(),
                    remote_confirmed: false,
                },
            })
        }
    }
}

/// Register with the poller and suspend until every job is settled, the
/// deadline passes, the backend gives up, or a job is clobbered.
pub(crate) async fn wait_settled(
    handles: &[&JobHandle],
    deadline: Option<Instant>,
) -> Result<Outcome<()>> {
    let mut interests = Vec::with_capacity(handles.len());
    let mut receivers = Vec::with_capacity(handles.len());
    for handle in handles {
        if handle.is_clobbered() {
            return Err(Error::Clobbered(handle.id().clone()));
        }
        // stale failures from before this wait do not count
        handle.record.clear_unavailable();
        receivers.push(handle.record.subscribe());
        interests.push(handle.shared.poller.watch(handle.record.clone())?);
    }

    loop {
        let mut settled = true;
        for (handle, receiver) in handles.iter().zip(receivers.iter_mut()) {
            let state = receiver.borrow_and_update();
            if state.clobbered {
                return Err(Error::Clobbered(handle.id().clone()));
            }
            if let Some(reason) = &state.unavailable {
                return Err(Error::BackendUnavailable(reason.clone()));
            }
            settled &= state.is_done();
        }
        if settled {
            return Ok(Outcome::Ready(()));
        }

        let changed = select_all(receivers.iter_mut().map(|receiver| Box::pin(receiver.changed())))
            .map(|(changed, _, _)| changed);
        let changed = match deadline {
            Some(deadline) => {
                tokio::select! {
                    changed = changed => changed,
                    _ = time::sleep_until(deadline) => return Ok(Outcome::NotReady),
                }
            }
            None => changed.await,
        };
        if changed.is_err() {
            return Err(Error::BackendUnavailable("job state was dropped".into()));
        }
    }
}
