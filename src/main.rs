//! # Datastore Benchmark Coordinator - Main Entry Point
//!
//! The main function performs these key operations:
//! 1. **Parse arguments**: processes command-line configuration
//! 2. **Initialize logging**: colorized console output, optional log file
//! 3. **Build the batch**: load the checkpoint or build a fresh batch from
//!    the template given with `--batch`
//! 4. **Run**: dispatch all outstanding work until done or interrupted
//!
//! With `--plots-only` the checkpoint is only read and the plot tree
//! regenerated (plus the per-series files when `--series-dir` is given).
//!
//! ## Error Handling
//!
//! Failures of single work units are logged and do not change the exit
//! status; the next `--resume` run picks the affected points up again. Only
//! batch-level failures (existing checkpoint without `--resume`, malformed
//! files, checkpoint write errors) make the process exit unsuccessfully.

use anyhow::{bail, Context, Result};
use clap::Parser;
use ds_bench::{
    cli::Args,
    config::{BatchTemplate, CoordinatorConfig},
    coordinator::Coordinator,
    logging, BatchSpec,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init_logging(args.verbose, args.quiet, args.log_file.as_deref())?;

    info!(version = ds_bench::VERSION, "Starting datastore benchmark coordinator");

    let config = CoordinatorConfig::from(&args).resolved()?;
    info!("Configuration: {:?}", config);

    if args.plots_only {
        let batch = BatchSpec::load(&config.checkpoint)?;
        let coordinator = Coordinator::new(batch, config);
        let charts = coordinator.plots().await?;
        let exported = coordinator.export_series().await?;
        info!(charts, exported, "plots-only run finished");
        return Ok(());
    }

    if !config.worker_bin.exists() {
        bail!("benchmark program {} does not exist", config.worker_bin.display());
    }

    let template = args.batch.clone();
    let mut coordinator = Coordinator::build(config, move || match template {
        Some(path) => BatchTemplate::load(&path)?.into_batch(Vec::new()),
        None => Err(ds_bench::BatchError::InvalidTemplate(
            "no checkpoint found and no --batch template given".to_string(),
        )),
    })
    .context("failed to build batch")?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, no further units will be started");
                cancel.cancel();
            }
        }
    });

    let summary = coordinator.start(cancel).await?;
    if summary.failed > 0 {
        warn!(
            failed = summary.failed,
            "some units failed; rerun with --resume to retry them"
        );
    }

    info!("Datastore benchmark coordinator finished");
    Ok(())
}
