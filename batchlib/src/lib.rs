mod actors;
pub mod backend;
pub mod config;
pub mod errors;
pub mod job;
pub mod local;
pub mod map;
pub mod retry;
pub mod session;
pub mod spec;
pub mod status;
pub mod testing;
pub mod types;

pub use backend::{BatchBackend, IndexStatus, StatusSnapshot};
pub use config::{PollConfig, SessionConfig};
pub use errors::{BackendError, Error, ItemFailure, Result};
pub use job::{JobHandle, Outcome, StatusReport, Termination};
pub use local::{ItemContext, LocalBackend, LocalConfig};
pub use map::MapFuture;
pub use session::{ClobberOptions, ClobberReport, Session};
pub use spec::{build, EntryPoint, JobSpec, ResourceRequest};
pub use status::{ItemState, JobStatus, StatusSummary};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn basic() {
        let backend = LocalBackend::builder()
            .register("echo", |s: String| async move { Ok::<_, String>(s) })
            .build();
        let session = Session::new(Arc::new(backend));
        let echo_str = "hello world!";
        let spec = build("echo", &echo_str, ResourceRequest::default(), vec![])
            .expect("valid spec");
        let job = session.submit(spec).await.expect("job start err");
        let output: Vec<String> = job
            .result(Some(Duration::from_secs(30)))
            .await
            .expect("failed to grab the job's result");
        assert_eq!(output, vec![echo_str.to_string()]);
    }
}
