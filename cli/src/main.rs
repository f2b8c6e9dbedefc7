mod arg_parser;
mod entry_points;

use arg_parser::{ArgParser, JobArgs, SubCommand};
use batchlib::{JobSpec, LocalConfig, ResourceRequest, Session, SessionConfig};

use clap::Parser;
use std::{error, sync::Arc, time::Duration};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            (0..num).map(|i| start + step * i as f64).collect()
        }
    }
}

fn resources(job: &JobArgs) -> ResourceRequest {
    ResourceRequest::new(job.memory, job.vcpus, job.retries)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = ArgParser::parse();
    let backend = entry_points::local_backend(LocalConfig {
        max_vcpus: args.max_vcpus,
        start_delay: Duration::from_millis(args.start_delay_ms),
        ..Default::default()
    });
    let config = SessionConfig::default()
        .with_poll_intervals(
            Duration::from_millis(args.poll_initial_ms),
            Duration::from_secs(args.poll_max_secs),
        )
        .with_max_array_size(args.max_array_size);
    let session = Session::with_config(Arc::new(backend), config);

    match args.sub_command {
        SubCommand::Map {
            entry,
            start,
            stop,
            num,
            job,
        } => {
            let inputs = linspace(start, stop, num);
            let future = session
                .map_with(entry.name(), inputs.clone(), resources(&job), job.envs.clone())
                .await?;
            info!(items = future.len(), jobs = future.jobs().len(), "Map submitted");
            print!("{}", session.view_jobs().await);
            let results: Vec<f64> = future.result(job.timeout.map(Duration::from_secs)).await?;
            print!("{}", session.view_jobs().await);
            for (input, output) in inputs.iter().zip(results) {
                println!("{:>12.6} -> {:.6}", input, output);
            }
        }
        SubCommand::Submit {
            entry,
            argument,
            job,
        } => {
            let spec = JobSpec::builder(entry.name())
                .argument(&argument)
                .resources(resources(&job))
                .envs(job.envs.clone())
                .build()?;
            let handle = session.submit(spec).await?;
            println!("Started job id: {}", handle.id());
            let results: Vec<f64> = handle.result(job.timeout.map(Duration::from_secs)).await?;
            for output in results {
                println!("{}", output);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linspace_includes_both_ends() {
        let points = linspace(0.1, 100.0, 17);
        assert_eq!(points.len(), 17);
        assert_eq!(points[0], 0.1);
        assert!((points[16] - 100.0).abs() < 1e-9);
        assert_eq!(linspace(3.0, 9.0, 1), vec![3.0]);
        assert!(linspace(3.0, 9.0, 0).is_empty());
    }
}
