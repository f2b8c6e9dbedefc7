use crate::errors::BackendError;
use crate::spec::JobSpec;
use crate::status::{JobStatus, StatusSummary};
use crate::types::{ArrayIndex, JobId, Payload};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::result;

pub type BackendResult<T> = result::Result<T, BackendError>;

/// The only component allowed to talk to the remote compute service.
///
/// `describe`, `terminate` and `fetch_result` must be idempotent so callers
/// can retry them. `submit_array` is not: every successful call creates a
/// new job, so the core never retries it.
#[async_trait]
pub trait BatchBackend: Send + Sync {
    /// Submit `count` items of `spec` as one array job.
    async fn submit_array(&self, spec: &JobSpec, count: usize) -> BackendResult<JobId>;

    async fn describe(&self, job_id: &JobId) -> BackendResult<StatusSnapshot>;

    async fn terminate(&self, job_id: &JobId, reason: &str) -> BackendResult<()>;

    /// Serialized result of a `SUCCEEDED` item.
    async fn fetch_result(&self, job_id: &JobId, index: ArrayIndex) -> BackendResult<Payload>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStatus {
    pub status: JobStatus,
    /// Attempts finished so far.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl IndexStatus {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            attempts: 0,
            reason: None,
        }
    }
}

/// One `describe` answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub job_id: JobId,
    pub overall: JobStatus,
    pub status_summary: StatusSummary,
    pub items: Vec<IndexStatus>,
}

impl StatusSnapshot {
    /// Build a snapshot, deriving the summary from `items`.
    pub fn new(job_id: JobId, overall: JobStatus, items: Vec<IndexStatus>) -> Self {
        let status_summary = items.iter().map(|item| item.status).collect();
        Self {
            job_id,
            overall,
            status_summary,
            items,
        }
    }

    pub fn failure_reasons(&self) -> BTreeMap<ArrayIndex, String> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.status == JobStatus::Failed)
            .map(|(index, item)| {
                let reason = item
                    .reason
                    .clone()
                    .unwrap_or_else(|| "no reason reported".to_string());
                (index, reason)
            })
            .collect()
    }
}

/// Overall status of an array job derived from its items, the way AWS Batch
/// reports an array parent: `PENDING` while every open item is still queued,
/// `RUNNING` once one has started, terminal when all items are.
pub fn overall_status<'a>(items: impl IntoIterator<Item = &'a JobStatus>) -> JobStatus {
    let mut any_open = false;
    let mut any_started = false;
    let mut any_failed = false;
    let mut any_cancelled = false;
    let mut any_seen = false;
    for status in items {
        any_seen = true;
        match status {
            JobStatus::Submitted | JobStatus::Pending | JobStatus::Runnable => any_open = true,
            JobStatus::Starting | JobStatus::Running => {
                any_open = true;
                any_started = true;
            }
            JobStatus::Succeeded => {}
            JobStatus::Failed => any_failed = true,
            JobStatus::Cancelled => any_cancelled = true,
        }
    }
    match (any_seen, any_open, any_started) {
        (false, _, _) => JobStatus::Submitted,
        (true, true, true) => JobStatus::Running,
        (true, true, false) => JobStatus::Pending,
        (true, false, _) if any_cancelled => JobStatus::Cancelled,
        (true, false, _) if any_failed => JobStatus::Failed,
        (true, false, _) => JobStatus::Succeeded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    #[test]
    fn overall_follows_array_parent_rules() {
        assert_eq!(overall_status(&[Runnable, Runnable]), Pending);
        assert_eq!(overall_status(&[Runnable, Starting]), Running);
        assert_eq!(overall_status(&[Succeeded, Runnable]), Pending);
        assert_eq!(overall_status(&[Succeeded, Succeeded]), Succeeded);
        assert_eq!(overall_status(&[Succeeded, Failed]), Failed);
        assert_eq!(overall_status(&[Failed, Cancelled]), Cancelled);
        assert_eq!(overall_status(&[]), Submitted);
    }

    #[test]
    fn snapshot_summary_and_failures() {
        let mut failed = IndexStatus::new(Failed);
        failed.reason = Some("exit code 1".into());
        let snapshot = StatusSnapshot::new(
            "job".into(),
            Failed,
            vec![IndexStatus::new(Succeeded), failed, IndexStatus::new(Failed)],
        );
        assert_eq!(snapshot.status_summary.count(Failed), 2);
        let reasons = snapshot.failure_reasons();
        assert_eq!(reasons.get(&1).map(String::as_str), Some("exit code 1"));
        assert_eq!(reasons.get(&2).map(String::as_str), Some("no reason reported"));
        assert!(!reasons.contains_key(&0));
    }
}
