//! In-process [`BatchBackend`] that runs registered Rust callables on a
//! bounded tokio worker pool.
//!
//! Callables are registered by name; a [`JobSpec`]'s entry point selects one.
//! Each array item gets its own worker, which waits `start_delay`, takes
//! `vcpus` permits from the shared pool and runs up to `retries` attempts.

use crate::actors::coordinator::CoordinatorHandle;
use crate::backend::{BackendResult, BatchBackend, StatusSnapshot};
use crate::spec::{ItemSpec, JobSpec, ARRAY_INDEX_ENV};
use crate::types::{ArrayIndex, Envs, JobId, Payload};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub type Callable =
    Arc<dyn Fn(ItemContext, Payload) -> BoxFuture<'static, Result<Payload, String>> + Send + Sync>;
pub type Registry = Arc<HashMap<String, Callable>>;

/// Capacity of the simulated compute environment.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub max_vcpus: u32,
    pub max_memory_mib: u32,
    /// Time an item spends in `RUNNABLE` before it may start.
    pub start_delay: Duration,
    /// How long a finished job stays describable before it is forgotten.
    pub retention: Duration,
    pub message_capacity: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_vcpus: 256,
            max_memory_mib: 64_000,
            start_delay: Duration::from_millis(250),
            retention: Duration::from_secs(24 * 3600),
            message_capacity: 64,
        }
    }
}

/// What a running item knows about itself.
#[derive(Debug, Clone)]
pub struct ItemContext {
    pub job_id: JobId,
    pub index: ArrayIndex,
    /// 1-based attempt number.
    pub attempt: u32,
    /// The job's variables followed by `BATCH_JOB_ARRAY_INDEX`.
    pub envs: Envs,
}

impl ItemContext {
    pub(crate) fn new(job_id: &JobId, item: &ItemSpec<'_>, attempt: u32) -> Self {
        let mut envs = item.envs.clone();
        envs.push((ARRAY_INDEX_ENV.to_string(), item.index.to_string()));
        Self {
            job_id: job_id.clone(),
            index: item.index,
            attempt,
            envs,
        }
    }

    pub fn env(&self, name: &str) -> Option<&str> {
        self.envs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Default)]
pub struct LocalBackendBuilder {
    registry: HashMap<String, Callable>,
    config: LocalConfig,
}

impl LocalBackendBuilder {
    pub fn config(mut self, config: LocalConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_vcpus(mut self, max_vcpus: u32) -> Self {
        self.config.max_vcpus = max_vcpus;
        self
    }

    pub fn start_delay(mut self, start_delay: Duration) -> Self {
        self.config.start_delay = start_delay;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.config.retention = retention;
        self
    }

    /// Register a callable taking the item's argument.
    pub fn register<A, R, E, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        self.register_with_context(name, move |_ctx: ItemContext, argument: A| f(argument))
    }

    /// Register a callable that also receives the item's [`ItemContext`].
    pub fn register_with_context<A, R, E, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(ItemContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let f = Arc::new(f);
        let callable: Callable = Arc::new(move |ctx: ItemContext, payload: Payload| {
            let f = f.clone();
            async move {
                let argument: A = serde_json::from_slice(&payload)
                    .map_err(|err| format!("invalid argument: {}", err))?;
                let value = f(ctx, argument).await.map_err(|err| err.to_string())?;
                serde_json::to_vec(&value)
                    .map(Payload::from)
                    .map_err(|err| format!("unserializable result: {}", err))
            }
            .boxed()
        });
        self.registry.insert(name.into(), callable);
        self
    }

    /// Spawn the coordinator. Must be called inside a tokio runtime.
    pub fn build(self) -> LocalBackend {
        let coordinator = CoordinatorHandle::spawn(
            self.config.message_capacity,
            Arc::new(self.registry),
            self.config,
        );
        LocalBackend { coordinator }
    }
}

#[derive(Clone)]
pub struct LocalBackend {
    coordinator: CoordinatorHandle,
}

impl LocalBackend {
    pub fn builder() -> LocalBackendBuilder {
        LocalBackendBuilder::default()
    }
}

#[async_trait]
impl BatchBackend for LocalBackend {
    async fn submit_array(&self, spec: &JobSpec, count: usize) -> BackendResult<JobId> {
        self.coordinator
            .submit_array(Arc::new(spec.clone()), count)
            .await
    }

    async fn describe(&self, job_id: &JobId) -> BackendResult<StatusSnapshot> {
        self.coordinator.describe(job_id.clone()).await
    }

    async fn terminate(&self, job_id: &JobId, reason: &str) -> BackendResult<()> {
        self.coordinator
            .terminate(job_id.clone(), reason.to_string())
            .await
    }

    async fn fetch_result(&self, job_id: &JobId, index: ArrayIndex) -> BackendResult<Payload> {
        self.coordinator.fetch_result(job_id.clone(), index).await
    }
}
