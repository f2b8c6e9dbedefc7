use crate::types::Payload;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a batch job or of one of its array items.
///
/// Variants are declared in lifecycle order; `Cancelled` is local-only and
/// never reported by a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    Pending,
    Runnable,
    Starting,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Submitted,
        JobStatus::Pending,
        JobStatus::Runnable,
        JobStatus::Starting,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Position along the forward path. Both terminal outcomes share a rank.
    pub(crate) fn rank(self) -> u8 {
        match self {
            JobStatus::Submitted => 0,
            JobStatus::Pending => 1,
            JobStatus::Runnable => 2,
            JobStatus::Starting => 3,
            JobStatus::Running => 4,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Pending => "PENDING",
            JobStatus::Runnable => "RUNNABLE",
            JobStatus::Starting => "STARTING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job status: {}", s))
    }
}

/// Per-status item counts, e.g. `summary.count(JobStatus::Runnable)`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary(BTreeMap<JobStatus, usize>);

impl StatusSummary {
    pub fn count(&self, status: JobStatus) -> usize {
        self.0.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobStatus, usize)> + '_ {
        self.0.iter().map(|(status, count)| (*status, *count))
    }
}

impl FromIterator<JobStatus> for StatusSummary {
    fn from_iter<I: IntoIterator<Item = JobStatus>>(iter: I) -> Self {
        let mut counts = BTreeMap::new();
        for status in iter {
            *counts.entry(status).or_insert(0) += 1;
        }
        Self(counts)
    }
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .iter()
            .map(|(status, count)| format!("{}={}", status, count))
            .collect();
        f.write_str(&parts.join(" "))
    }
}

/// What a caller sees of one array item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    Running,
    Succeeded(Payload),
    Failed(String),
    Cancelled,
}

impl ItemState {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            ItemState::Succeeded(_) | ItemState::Failed(_) | ItemState::Cancelled
        )
    }
}

/// Result of feeding one observation into an [`ItemTracker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Advanced,
    /// Moved back to `RUNNABLE` because a new attempt started.
    Restarted,
    Ignored,
}

impl Transition {
    pub fn changed(self) -> bool {
        !matches!(self, Transition::Ignored)
    }
}

/// Locally tracked state of one array index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemTracker {
    status: JobStatus,
    attempts: u32,
    reason: Option<String>,
    result: Option<Payload>,
}

impl Default for ItemTracker {
    fn default() -> Self {
        Self {
            status: JobStatus::Submitted,
            attempts: 0,
            reason: None,
            result: None,
        }
    }
}

impl ItemTracker {
    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn state(&self) -> ItemState {
        match self.status {
            JobStatus::Submitted | JobStatus::Pending | JobStatus::Runnable => ItemState::Pending,
            JobStatus::Starting | JobStatus::Running => ItemState::Running,
            JobStatus::Succeeded => ItemState::Succeeded(self.result.clone().unwrap_or_default()),
            JobStatus::Failed => ItemState::Failed(self.reason.clone().unwrap_or_default()),
            JobStatus::Cancelled => ItemState::Cancelled,
        }
    }

    /// Apply a backend observation.
    ///
    /// `Succeeded` is rejected here: it is only reachable through
    /// [`ItemTracker::succeed`], so a succeeded item always has its payload.
    pub fn observe(&mut self, status: JobStatus, attempts: u32, reason: Option<String>) -> Transition {
        if self.status.is_terminal() || status == JobStatus::Succeeded {
            return Transition::Ignored;
        }
        if status.rank() < self.status.rank() {
            if status == JobStatus::Runnable && attempts > self.attempts {
                self.status = status;
                self.attempts = attempts;
                self.reason = reason;
                return Transition::Restarted;
            }
            return Transition::Ignored;
        }
        let changed = status != self.status || attempts > self.attempts;
        self.status = status;
        self.attempts = self.attempts.max(attempts);
        if reason.is_some() {
            self.reason = reason;
        }
        if changed {
            Transition::Advanced
        } else {
            Transition::Ignored
        }
    }

    pub fn succeed(&mut self, payload: Payload, attempts: u32) -> Transition {
        if self.status.is_terminal() {
            return Transition::Ignored;
        }
        self.status = JobStatus::Succeeded;
        self.attempts = self.attempts.max(attempts);
        self.result = Some(payload);
        Transition::Advanced
    }

    pub fn cancel(&mut self, reason: &str) -> Transition {
        if self.status.is_terminal() {
            return Transition::Ignored;
        }
        self.status = JobStatus::Cancelled;
        self.reason = Some(reason.to_string());
        Transition::Advanced
    }
}
