//! `scantask worker` command.
//!
//! Reads the worker configuration from the environment, connects to
//! JetStream and consumes jobs until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use scantask_core::WorkerConfig;
use scantask_queue::{JetStreamQueue, Worker};
use scantask_runtime::ScanPipeline;
use tokio_util::sync::CancellationToken;

#[derive(Args)]
pub struct WorkerArgs {
    /// Override the scanner executable (default: SCANNER_PATH or "grype")
    #[arg(long)]
    pub scanner: Option<PathBuf>,

    /// Override the root of per-job working directories
    #[arg(long)]
    pub work_dir: Option<PathBuf>,
}

impl WorkerArgs {
    fn apply(&self, config: &mut WorkerConfig) {
        if let Some(scanner) = &self.scanner {
            config.scanner.binary = scanner.clone();
        }
        if let Some(work_dir) = &self.work_dir {
            config.work_dir = work_dir.clone();
        }
    }
}

pub async fn execute(args: WorkerArgs) -> anyhow::Result<()> {
    let mut config = WorkerConfig::from_env().context("invalid worker configuration")?;
    args.apply(&mut config);

    let queue = JetStreamQueue::connect(&config.queue).await?;
    let consumer = queue.consumer().await?;
    let pipeline = ScanPipeline::from_config(&config)?;
    let worker = Worker::new(Arc::new(pipeline), Arc::new(queue.publisher()), &config);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing current job");
            signal.cancel();
        }
    });

    tracing::info!(
        scanner = %config.scanner.binary.display(),
        work_dir = %config.work_dir.display(),
        lease_renewal_secs = config.lease_renewal_secs,
        "Worker started"
    );
    worker.run(&consumer, shutdown).await?;
    queue.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_to_config() {
        let args = WorkerArgs {
            scanner: Some(PathBuf::from("/opt/grype")),
            work_dir: None,
        };
        let mut config = WorkerConfig::default();
        let default_work_dir = config.work_dir.clone();
        args.apply(&mut config);

        assert_eq!(config.scanner.binary, PathBuf::from("/opt/grype"));
        assert_eq!(config.work_dir, default_work_dir);
    }
}
