//! Fault injection for code built on a [`BatchBackend`].

use crate::backend::{BackendResult, BatchBackend, StatusSnapshot};
use crate::errors::BackendError;
use crate::spec::JobSpec;
use crate::types::{ArrayIndex, JobId, Payload};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Wraps a backend, counts the calls made through it and fails them on
/// demand.
pub struct FlakyBackend<B> {
    inner: B,
    failing_describes: AtomicUsize,
    partitioned: AtomicBool,
    submits_allowed: AtomicUsize,
    submits: AtomicUsize,
    terminates: AtomicUsize,
    fetches: AtomicUsize,
    describes: Mutex<HashMap<JobId, usize>>,
}

impl<B: BatchBackend> FlakyBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            failing_describes: AtomicUsize::new(0),
            partitioned: AtomicBool::new(false),
            submits_allowed: AtomicUsize::new(usize::MAX),
            submits: AtomicUsize::new(0),
            terminates: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            describes: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// The next `count` describes fail with a transient error.
    pub fn fail_next_describes(&self, count: usize) {
        self.failing_describes.store(count, Ordering::SeqCst);
    }

    /// While partitioned, every call but `submit_array` fails as unavailable.
    pub fn set_partitioned(&self, partitioned: bool) {
        self.partitioned.store(partitioned, Ordering::SeqCst);
    }

    /// Only the next `count` submissions go through; later ones are rejected.
    pub fn allow_submits(&self, count: usize) {
        self.submits_allowed.store(count, Ordering::SeqCst);
    }

    pub fn submit_calls(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> usize {
        self.terminates.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn describe_calls(&self, job_id: &JobId) -> usize {
        self.describes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_describe_calls(&self) -> usize {
        self.describes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }

    fn check_partition(&self) -> BackendResult<()> {
        if self.partitioned.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("network partition".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl<B: BatchBackend> BatchBackend for FlakyBackend<B> {
    async fn submit_array(&self, spec: &JobSpec, count: usize) -> BackendResult<JobId> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let allowed = self
            .submits_allowed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if allowed.is_err() {
            return Err(BackendError::Rejected("submission quota exceeded".into()));
        }
        self.inner.submit_array(spec, count).await
    }

    async fn describe(&self, job_id: &JobId) -> BackendResult<StatusSnapshot> {
        *self
            .describes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(job_id.clone())
            .or_insert(0) += 1;
        self.check_partition()?;
        let injected = self
            .failing_describes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if injected.is_ok() {
            return Err(BackendError::Unavailable("throttled".into()));
        }
        self.inner.describe(job_id).await
    }

    async fn terminate(&self, job_id: &JobId, reason: &str) -> BackendResult<()> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        self.check_partition()?;
        self.inner.terminate(job_id, reason).await
    }

    async fn fetch_result(&self, job_id: &JobId, index: ArrayIndex) -> BackendResult<Payload> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.check_partition()?;
        self.inner.fetch_result(job_id, index).await
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::FlakyBackend;
    use crate::config::SessionConfig;
    use crate::local::LocalBackend;
    use crate::session::Session;
    use std::sync::Arc;
    use std::time::Duration;

    pub type Backend = Arc<FlakyBackend<LocalBackend>>;

    /// A local pool with a few entry points:
    /// `square` (f64), `hang` (never finishes), `sleepy` (sleeps its
    /// argument in milliseconds and returns it) and `odd_fails`.
    pub fn backend() -> Backend {
        let local = LocalBackend::builder()
            .start_delay(Duration::from_millis(250))
            .register("square", |x: f64| async move { Ok::<_, String>(x * x) })
            .register("hang", |_: u32| futures::future::pending::<Result<u32, String>>())
            .register("sleepy", |ms: u64| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<_, String>(ms)
            })
            .register("odd_fails", |x: u32| async move {
                if x % 2 == 1 {
                    Err(format!("{} is odd", x))
                } else {
                    Ok(x)
                }
            })
            .build();
        Arc::new(FlakyBackend::new(local))
    }

    pub fn session(backend: &Backend) -> Session {
        session_with(backend, SessionConfig::default())
    }

    pub fn session_with(backend: &Backend, config: SessionConfig) -> Session {
        Session::with_config(backend.clone(), config)
    }
}
