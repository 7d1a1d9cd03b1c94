//! # Batch Coordinator
//!
//! Top-level orchestration of a batch run. The coordinator moves through four
//! states:
//!
//! - **Building**: load the checkpoint (resume) or build a fresh batch
//! - **Dispatching**: start the worker pools, enqueue every outstanding work
//!   unit per instance type, close the queues
//! - **Collecting**: record each successful unit into its series and persist
//!   the whole batch right away; log failed units and move on
//! - **Done**: plots regenerated, summary returned
//!
//! Collection ends when every worker has stopped or when the cancellation
//! token fires. Both paths regenerate the plots from whatever has been
//! measured.
//!
//! ## Failure semantics
//!
//! A failing unit is never recorded, so it shows up again in the outstanding
//! work of the next resumed run. Failing to write the checkpoint is fatal.

use crate::batch::{self, BatchSpec};
use crate::config::CoordinatorConfig;
use crate::dispatcher::{self, UnitResult};
use crate::error::BatchError;
use crate::plot::{self, PlotRenderer};
use crate::runner::{RemoteUnitExecutor, UnitExecutor};
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Building,
    Dispatching,
    Collecting,
    Done,
}

/// Outcome counts of one coordinator run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Units measured and recorded during this run
    pub completed: usize,
    /// Units that failed and stay outstanding
    pub failed: usize,
    /// Collection stopped because of cancellation
    pub cancelled: bool,
}

pub struct Coordinator {
    batch: Arc<BatchSpec>,
    config: CoordinatorConfig,
    executor: Arc<dyn UnitExecutor>,
    renderer: Arc<dyn PlotRenderer>,
    state: CoordinatorState,
    run_id: String,
}

impl Coordinator {
    /// Load the checkpoint named by `config`, or build a fresh batch with
    /// `new` if there is none.
    ///
    /// Refuses to start over an existing checkpoint unless `config.resume`
    /// is set.
    pub fn build<F>(config: CoordinatorConfig, new: F) -> Result<Self, BatchError>
    where
        F: FnOnce() -> Result<BatchSpec, BatchError>,
    {
        let run_id = crate::utils::generate_run_id();
        let batch = info_span!("batch", run_id = %run_id)
            .in_scope(|| batch::build_batch(&config.checkpoint, config.resume, new))?;
        Ok(Self::with_run_id(batch, config, run_id))
    }

    /// Coordinator over an already built batch.
    pub fn new(batch: BatchSpec, config: CoordinatorConfig) -> Self {
        Self::with_run_id(batch, config, crate::utils::generate_run_id())
    }

    fn with_run_id(batch: BatchSpec, config: CoordinatorConfig, run_id: String) -> Self {
        let executor = Arc::new(RemoteUnitExecutor::new(config.worker_bin.clone()));
        let renderer = config.plot_format.renderer();
        Self {
            batch: Arc::new(batch),
            config,
            executor,
            renderer,
            state: CoordinatorState::Building,
            run_id,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn UnitExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PlotRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn batch(&self) -> &Arc<BatchSpec> {
        &self.batch
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Run every outstanding unit of the batch.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<RunSummary> {
        let span = info_span!("batch", run_id = %self.run_id);
        self.run(cancel).instrument(span).await
    }

    async fn run(&mut self, cancel: CancellationToken) -> Result<RunSummary> {
        let started = Instant::now();
        self.state = CoordinatorState::Dispatching;

        let mut dispatch = dispatcher::spawn(
            Arc::clone(&self.batch),
            Arc::clone(&self.executor),
            cancel.clone(),
        );

        let mut queued = 0;
        for itype in self.batch.jobs.keys() {
            let Some(queue) = dispatch.queues.get(itype) else {
                warn!(instance_type = %itype, "no workers for instance type, skipping its jobs");
                continue;
            };

            let units = self.batch.work_units(itype);
            info!(instance_type = %itype, units = units.len(), "enqueueing work");
            queued += units.len();
            for unit in units {
                queue
                    .push(unit)
                    .map_err(|_| anyhow!("work queue for {} closed while enqueueing", itype))?;
            }
        }
        for queue in dispatch.queues.values() {
            queue.close();
        }
        info!(
            queued,
            total_points = self.batch.total_points(),
            "all work enqueued"
        );

        self.state = CoordinatorState::Collecting;
        let mut summary = RunSummary::default();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("stopping result collection (cancelled)");
                    summary.cancelled = true;
                    break;
                }
                res = dispatch.results.recv() => match res {
                    Some(res) => self.collect(res, &mut summary).await?,
                    None => {
                        info!("stopping result collection (all workers done)");
                        break;
                    }
                },
            }
        }

        // on cancellation, in-flight units are left to finish on their own
        if !summary.cancelled {
            let panicked = dispatch.supervisor.await.context("worker supervisor failed")?;
            if panicked > 0 {
                warn!(panicked, "some worker tasks panicked");
            }
        }

        self.plots().await?;
        self.export_series().await?;
        self.state = CoordinatorState::Done;

        info!(
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            elapsed = %crate::utils::format_duration(started.elapsed()),
            "batch run finished"
        );
        Ok(summary)
    }

    async fn collect(&self, res: UnitResult, summary: &mut RunSummary) -> Result<()> {
        let UnitResult {
            instance_type,
            worker_id,
            unit,
            result,
        } = res;

        let series = self
            .batch
            .series(&instance_type, unit.series)
            .ok_or_else(|| anyhow!("result for unknown series {} of {}", unit.series, instance_type))?;
        let datastore = self
            .batch
            .datastores
            .get(unit.datastore)
            .ok_or_else(|| anyhow!("result for unknown datastore {}", unit.datastore))?;

        match result {
            Ok(measurement) => {
                info!(
                    instance_type = %instance_type,
                    worker = worker_id,
                    series = %series.plot_name,
                    datastore = %datastore.name,
                    point = unit.point,
                    per_op = %crate::utils::format_duration_ns(measurement.ns_per_op as u64),
                    "unit completed"
                );
                if series.record(&datastore.name, unit.point, measurement) {
                    summary.completed += 1;
                }
                self.save().await?;
            }
            Err(e) => {
                error!(
                    instance_type = %instance_type,
                    worker = worker_id,
                    series = %series.plot_name,
                    test = %series.test,
                    datastore = %datastore.name,
                    point = unit.point,
                    error = %e,
                    "work unit failed"
                );
                summary.failed += 1;
            }
        }
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let batch = Arc::clone(&self.batch);
        let path = self.config.checkpoint.clone();
        tokio::task::spawn_blocking(move || batch.save(&path))
            .await
            .context("checkpoint task panicked")?
            .context("failed to save checkpoint")
    }

    /// Regenerate the standard plot tree from the current results.
    pub async fn plots(&self) -> Result<usize> {
        let batch = Arc::clone(&self.batch);
        let renderer = Arc::clone(&self.renderer);
        let root = self.config.plot_dir.clone();
        tokio::task::spawn_blocking(move || {
            plot::standard_plots(&batch, &root, renderer.as_ref())
        })
        .await
        .context("plot task panicked")?
        .context("failed to regenerate plots")
    }

    /// Write every series on its own below the configured series directory,
    /// one subdirectory per instance type. Returns the number of files written.
    pub async fn export_series(&self) -> Result<usize> {
        let Some(root) = self.config.series_dir.clone() else {
            return Ok(0);
        };
        let batch = Arc::clone(&self.batch);
        tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut written = 0;
            for (itype, series) in &batch.jobs {
                let dir = root.join(itype);
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
                for s in series {
                    let path = s.save_to(&dir)?;
                    debug!(path = %path.display(), "series exported");
                    written += 1;
                }
            }
            Ok(written)
        })
        .await
        .context("series export task panicked")?
        .context("failed to export series")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Worker;
    use crate::error::UnitError;
    use crate::options::{BenchOptions, WorkerDatastore};
    use crate::report::Measurement;
    use crate::runner::UnitJob;
    use crate::series::Series;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    /// Fails every odd point, measures the rest.
    struct OddFails;

    #[async_trait]
    impl UnitExecutor for OddFails {
        async fn execute(&self, job: UnitJob<'_>) -> Result<Measurement, UnitError> {
            if job.point % 2 == 1 {
                return Err(UnitError::UnexpectedBenchCount(0));
            }
            Ok(Measurement {
                name: "BenchmarkSpec".into(),
                ns_per_op: 1.0,
                ..Default::default()
            })
        }
    }

    fn config(dir: &std::path::Path) -> CoordinatorConfig {
        CoordinatorConfig {
            checkpoint: dir.join("results.json"),
            plot_dir: dir.join("x_plots"),
            worker_bin: dir.join("worker.test"),
            resume: false,
            ..Default::default()
        }
    }

    fn batch(itype: &str) -> BatchSpec {
        BatchSpec {
            datastores: vec![WorkerDatastore::new("memory-map", "memory-map")],
            workers: BTreeMap::from([("local".to_string(), vec![Worker::local()])]),
            jobs: BTreeMap::from([(
                itype.to_string(),
                vec![Arc::new(Series::new(
                    "get",
                    "get",
                    (1..=4).map(|i| BenchOptions::new(i, 1024, 1)).collect(),
                ))],
            )]),
        }
    }

    #[tokio::test]
    async fn test_failed_units_stay_outstanding() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = Coordinator::build(config(dir.path()), || Ok(batch("local")))
            .unwrap()
            .with_executor(Arc::new(OddFails));
        assert_eq!(coord.state(), CoordinatorState::Building);

        let summary = coord.start(CancellationToken::new()).await.unwrap();
        assert_eq!(
            summary,
            RunSummary {
                completed: 2,
                failed: 2,
                cancelled: false
            }
        );
        assert_eq!(coord.state(), CoordinatorState::Done);

        let saved = BatchSpec::load(&dir.path().join("results.json")).unwrap();
        assert_eq!(saved.series("local", 0).unwrap().todo("memory-map"), vec![1, 3]);
        assert!(dir.path().join("x_plots/local/get/prime-count-nsop.svg").exists());
    }

    #[tokio::test]
    async fn test_series_exported_per_instance_type() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoordinatorConfig {
            series_dir: Some(dir.path().join("series")),
            plot_format: plot::PlotFormat::Json,
            ..config(dir.path())
        };
        let mut coord = Coordinator::new(batch("local"), config).with_executor(Arc::new(OddFails));
        coord.start(CancellationToken::new()).await.unwrap();

        assert!(dir.path().join("x_plots/local/get/prime-count-nsop.json").exists());
        let exported = Series::load(&dir.path().join("series/local/results-get.json")).unwrap();
        assert_eq!(exported.test, "get");
        assert_eq!(exported.todo("memory-map"), vec![1, 3]);
        assert_eq!(coord.export_series().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_jobs_without_workers_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = Coordinator::new(batch("m5.large"), config(dir.path()))
            .with_executor(Arc::new(OddFails));

        let summary = coord.start(CancellationToken::new()).await.unwrap();
        assert_eq!(summary, RunSummary::default());
        assert_eq!(
            coord.batch().series("m5.large", 0).unwrap().todo("memory-map"),
            vec![0, 1, 2, 3]
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut coord = Coordinator::new(batch("local"), config(dir.path()))
            .with_executor(Arc::new(OddFails));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = coord.start(cancel).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.completed, 0);
        // plots are regenerated on the cancellation path too
        assert!(dir.path().join("x_plots/local").exists());
    }
}
