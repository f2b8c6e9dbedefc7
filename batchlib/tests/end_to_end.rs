use batchlib::testing::FlakyBackend;
use batchlib::{
    BatchBackend, Error, JobSpec, JobStatus, LocalBackend, ResourceRequest, Session,
    SessionConfig,
};
use std::sync::Arc;
use std::time::Duration;

fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    let step = (stop - start) / (num - 1) as f64;
    (0..num).map(|i| start + step * i as f64).collect()
}

fn local() -> LocalBackend {
    LocalBackend::builder()
        .start_delay(Duration::from_millis(500))
        .register("notebook::cube_root", |x: f64| async move {
            tokio::time::sleep(Duration::from_millis((100.0 - x) as u64 * 10)).await;
            Ok::<_, String>(x.cbrt())
        })
        .build()
}

#[tokio::test(start_paused = true)]
async fn notebook_scenario() {
    let backend = Arc::new(local());
    let session = Session::new(backend.clone());
    let inputs = linspace(0.1, 100.0, 17);

    let future = session
        .map_with(
            "notebook::cube_root",
            inputs.clone(),
            ResourceRequest::new(128, 1, 3),
            vec![("SCALE".to_string(), "1".to_string())],
        )
        .await
        .expect("map submission");
    assert_eq!(future.len(), 17);
    assert!(!future.is_done());

    let job = &future.jobs()[0];
    let snapshot = backend.describe(job.id()).await.expect("describe");
    assert_eq!(snapshot.overall, JobStatus::Pending);
    assert_eq!(snapshot.status_summary.count(JobStatus::Runnable), 17);

    let table = session.view_jobs().await;
    assert!(table.contains(job.id().as_str()));
    assert!(table.contains("RUNNABLE=17"), "{}", table);

    let results: Vec<f64> = future
        .result(Some(Duration::from_secs(600)))
        .await
        .expect("every item succeeds");
    assert_eq!(results.len(), inputs.len());
    for (input, output) in inputs.iter().zip(&results) {
        assert!((output - input.cbrt()).abs() < 1e-9, "{} -> {}", input, output);
    }
    assert!(future.done().await);
    assert!(session.view_jobs().await.contains("SUCCEEDED=17"));
}

#[tokio::test(start_paused = true)]
async fn submitted_job_is_visible_immediately() {
    let backend = Arc::new(local());
    let session = Session::new(backend.clone());
    let spec = JobSpec::builder("notebook::cube_root")
        .argument(&27.0)
        .memory_mib(128)
        .build()
        .expect("valid spec");
    let job = session.submit(spec).await.expect("submit");
    let snapshot = backend.describe(job.id()).await.expect("describe");
    assert!(snapshot.overall >= JobStatus::Submitted);
    let report = job.status().await;
    assert_eq!(report.summary.total(), 1);
}

#[tokio::test(start_paused = true)]
async fn partition_during_wait_surfaces_as_unavailable() {
    let backend = Arc::new(FlakyBackend::new(local()));
    let session = Session::with_config(
        backend.clone(),
        SessionConfig::default().with_describe_attempts(2),
    );
    let future = session
        .map("notebook::cube_root", vec![1.0, 8.0], vec![])
        .await
        .expect("map submission");
    backend.set_partitioned(true);
    let err = future.result::<f64>(None).await.unwrap_err();
    assert!(matches!(err, Error::BackendUnavailable(_)), "{}", err);
    // only the link is down; the job itself is still known to the pool
    let behind_partition = backend
        .inner()
        .describe(future.jobs()[0].id())
        .await
        .expect("describe bypassing the partition");
    assert_eq!(behind_partition.items.len(), 2);

    // a new wait clears the marker and picks up where it left off
    backend.set_partitioned(false);
    let results: Vec<f64> = future.result(None).await.expect("results after recovery");
    assert!((results[1] - 2.0).abs() < 1e-9);
}
