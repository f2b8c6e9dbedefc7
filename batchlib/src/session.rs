use crate::actors::poller::PollerHandle;
use crate::backend::BatchBackend;
use crate::config::SessionConfig;
use crate::errors::{Error, Result};
use crate::job::{JobHandle, JobRecord, SessionShared, Termination};
use crate::map::MapFuture;
use crate::spec::{chunk_name, EntryPoint, JobSpec, ResourceRequest};
use crate::types::{Envs, JobId};
use futures::future::join_all;
use serde::Serialize;
use std::fmt::Write;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// What `clobber` should do besides forgetting the session's jobs.
#[derive(Clone, Debug, Default)]
pub struct ClobberOptions {
    /// Terminate jobs that have not finished yet.
    pub terminate_outstanding: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClobberReport {
    pub forgotten: usize,
    pub terminated: Vec<JobId>,
    /// Jobs cancelled locally whose remote termination was not confirmed.
    pub unconfirmed: Vec<(JobId, String)>,
}

/// Entry point of the library: submits jobs through one backend and tracks
/// every handle it hands out.
///
/// Must be created inside a tokio runtime; it spawns the status poller.
pub struct Session {
    shared: Arc<SessionShared>,
    jobs: Mutex<Vec<JobHandle>>,
}

impl Session {
    pub fn new(backend: Arc<dyn BatchBackend>) -> Self {
        Self::with_config(backend, SessionConfig::default())
    }

    pub fn with_config(backend: Arc<dyn BatchBackend>, config: SessionConfig) -> Self {
        let poller = PollerHandle::spawn(backend.clone(), &config);
        Self {
            shared: Arc::new(SessionShared {
                backend,
                poller,
                config,
            }),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn backend(&self) -> &Arc<dyn BatchBackend> {
        &self.shared.backend
    }

    /// Handles of every job submitted through this session and not clobbered.
    pub fn jobs(&self) -> Vec<JobHandle> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Submit `spec` as one array job. Submission is never retried.
    pub async fn submit(&self, spec: JobSpec) -> Result<JobHandle> {
        let max = self.shared.config.max_array_size;
        if spec.array_size() > max {
            return Err(Error::InvalidSpec(format!(
                "{} items exceed the maximum array size of {}",
                spec.array_size(),
                max
            )));
        }
        let job_id = self
            .shared
            .backend
            .submit_array(&spec, spec.array_size())
            .await?;
        info!(job_id = %job_id, name = %spec.name(), items = spec.array_size(), "Submitted job");
        let handle = JobHandle::new(JobRecord::new(job_id, &spec), self.shared.clone());
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.clone());
        Ok(handle)
    }

    /// Run `entry_point` once per input with the session's default resources.
    pub async fn map<A, I>(
        &self,
        entry_point: impl Into<EntryPoint>,
        inputs: I,
        envs: Envs,
    ) -> Result<MapFuture>
    where
        A: Serialize,
        I: IntoIterator<Item = A>,
    {
        let resources = self.shared.config.default_resources.clone();
        self.map_with(entry_point, inputs, resources, envs).await
    }

    /// Like [`Session::map`] with explicit resources. Inputs beyond the
    /// maximum array size are split over several jobs; if one of them cannot
    /// be submitted, the ones already submitted are terminated.
    pub async fn map_with<A, I>(
        &self,
        entry_point: impl Into<EntryPoint>,
        inputs: I,
        resources: ResourceRequest,
        envs: Envs,
    ) -> Result<MapFuture>
    where
        A: Serialize,
        I: IntoIterator<Item = A>,
    {
        let entry_point = entry_point.into();
        let whole = JobSpec::builder(entry_point.clone())
            .arguments(inputs)
            .resources(resources.clone())
            .envs(envs.clone())
            .build()?;
        let chunk_size = self.shared.config.max_array_size;
        if whole.array_size() <= chunk_size {
            let handle = self.submit(whole).await?;
            return Ok(MapFuture::new(vec![handle]));
        }

        // validate every chunk before anything reaches the backend
        let specs = whole
            .arguments()
            .chunks(chunk_size)
            .enumerate()
            .map(|(n, payloads)| {
                JobSpec::builder(entry_point.clone())
                    .name(chunk_name(&entry_point, n))
                    .payloads(payloads.iter().cloned())
                    .resources(resources.clone())
                    .envs(envs.clone())
                    .build()
            })
            .collect::<Result<Vec<_>>>()?;

        let mut handles = Vec::with_capacity(specs.len());
        for spec in specs {
            match self.submit(spec).await {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    warn!(error = %err, submitted = handles.len(), "Map submission failed, terminating submitted chunks");
                    let reason = format!("sibling submission failed: {}", err);
                    for handle in &handles {
                        if let Ok(Termination::LocalOnly { error }) = handle.terminate(&reason).await {
                            warn!(job_id = %handle.id(), %error, "Could not terminate chunk");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(MapFuture::new(handles))
    }

    /// Table of every tracked job, refreshed from the backend first.
    pub async fn view_jobs(&self) -> String {
        let jobs = self.jobs();
        let reports = join_all(jobs.iter().map(JobHandle::status)).await;
        let mut table = format!("{:<38} {:<24} {:<12} {}\n", "JOB ID", "NAME", "STATUS", "ITEMS");
        let mut degraded = false;
        for report in reports {
            let mut status = report.overall.to_string();
            if report.degraded.is_some() {
                status.push('*');
                degraded = true;
            }
            let _ = writeln!(
                table,
                "{:<38} {:<24} {:<12} {}",
                report.job_id, report.name, status, report.summary
            );
        }
        if degraded {
            table.push_str("* backend unreachable, showing the last known status\n");
        }
        table
    }

    /// Forget every job of this session, optionally terminating the ones
    /// still running. Clobbered handles refuse further waits.
    pub async fn clobber(&self, options: ClobberOptions) -> ClobberReport {
        let jobs = std::mem::take(&mut *self.jobs.lock().unwrap_or_else(PoisonError::into_inner));
        let mut report = ClobberReport {
            forgotten: jobs.len(),
            ..Default::default()
        };
        for job in &jobs {
            if options.terminate_outstanding && !job.is_done() {
                match job.terminate("clobbered").await {
                    Ok(Termination::Terminated) => report.terminated.push(job.id().clone()),
                    Ok(Termination::LocalOnly { error }) => {
                        report.unconfirmed.push((job.id().clone(), error))
                    }
                    Ok(Termination::AlreadyFinished) | Err(_) => {}
                }
            }
            job.clobber();
        }
        info!(forgotten = report.forgotten, terminated = report.terminated.len(), "Clobbered session");
        report
    }
}
