//! # Per-Unit Execution
//!
//! Running one work unit means running the benchmark program once, on one
//! machine, for one `(datastore, series, point)` triple:
//!
//! 1. open a fresh execution environment for the machine
//! 2. substitute the machine's template variables into the datastore config
//! 3. stage `spec.json`, the helper scripts and the benchmark program
//! 4. run the pre-run script, the benchmark program and the post-run script
//! 5. parse the benchmark report streamed from the program's stdout
//! 6. close the environment, whatever the outcome
//!
//! The report must hold exactly one group with exactly one line; anything
//! else is an error and nothing gets recorded for the unit.
//!
//! The dispatcher only sees the [`UnitExecutor`] trait, which keeps
//! scheduling tests independent of real processes.

use crate::batch::Worker;
use crate::env::{self, ExecEnv};
use crate::error::{ReportError, ScriptStage, UnitError};
use crate::options::{ScriptSpec, TestSpec, WorkerDatastore};
use crate::report::{self, Measurement, ReportSet};
use crate::series::Series;
use anyhow::Context;
use async_trait::async_trait;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// File names inside the scratch directory
pub mod staged {
    pub const SPEC: &str = "spec.json";
    pub const PRE_RUN: &str = "prerun.sh";
    pub const POST_RUN: &str = "postrun.sh";
    pub const WORKER: &str = "worker.test";
}

/// Everything needed to run one work unit.
#[derive(Debug, Clone)]
pub struct UnitJob<'a> {
    pub worker: &'a Worker,
    pub datastore: &'a WorkerDatastore,
    pub series: &'a Series,
    pub point: usize,
}

impl UnitJob<'_> {
    /// The document staged as `spec.json`, with the worker's variables applied.
    pub fn test_spec(&self) -> Result<TestSpec, UnitError> {
        let options = self.series.opts.get(self.point).copied().ok_or_else(|| {
            UnitError::Env(anyhow::anyhow!(
                "point {} is outside series {}",
                self.point,
                self.series.plot_name
            ))
        })?;

        Ok(TestSpec {
            datastore: self.datastore.with_vars(&self.worker.vars),
            test: self.series.test.clone(),
            options,
        })
    }
}

/// Runs single work units on behalf of the dispatcher.
#[async_trait]
pub trait UnitExecutor: Send + Sync {
    async fn execute(&self, job: UnitJob<'_>) -> Result<Measurement, UnitError>;
}

/// Executes units through the worker's configured [`env::ExecutionConfig`].
#[derive(Debug, Clone)]
pub struct RemoteUnitExecutor {
    worker_bin: PathBuf,
}

impl RemoteUnitExecutor {
    /// `worker_bin` is the benchmark program on this machine; it is copied
    /// into every scratch directory.
    pub fn new(worker_bin: impl Into<PathBuf>) -> Self {
        Self {
            worker_bin: worker_bin.into(),
        }
    }

    pub fn worker_bin(&self) -> &std::path::Path {
        &self.worker_bin
    }

    async fn run_in(&self, env: &dyn ExecEnv, job: &UnitJob<'_>) -> Result<Measurement, UnitError> {
        let spec = job.test_spec()?;
        let ds = &spec.datastore;

        let spec_json = serde_json::to_vec(&spec).map_err(|e| UnitError::Stage {
            file: staged::SPEC.to_string(),
            source: e.into(),
        })?;
        stage(env.write_file(staged::SPEC, spec_json, 0o644).await, staged::SPEC)?;

        if let Some(script) = &ds.pre_script {
            stage(
                env.copy_file(&script.path, staged::PRE_RUN, 0o755).await,
                staged::PRE_RUN,
            )?;
        }
        if let Some(script) = &ds.post_script {
            stage(
                env.copy_file(&script.path, staged::POST_RUN, 0o755).await,
                staged::POST_RUN,
            )?;
        }
        stage(
            env.copy_file(&self.worker_bin, staged::WORKER, 0o755).await,
            staged::WORKER,
        )?;

        if let Some(script) = &ds.pre_script {
            info!(datastore = %ds.name, args = %script.args, "running pre-run script");
            run_script(env, staged::PRE_RUN, script)
                .await
                .map_err(|source| UnitError::Script {
                    stage: ScriptStage::PreRun,
                    source,
                })?;
        }

        // once the pre-run script has run, the post-run script always runs
        let bench = run_benchmark(env, &ds.name).await;

        if let Some(script) = &ds.post_script {
            info!(datastore = %ds.name, args = %script.args, "running post-run script");
            let post = run_script(env, staged::POST_RUN, script)
                .await
                .map_err(|source| UnitError::Script {
                    stage: ScriptStage::PostRun,
                    source,
                });
            if let Err(post_err) = post {
                return match bench {
                    Err(e) => {
                        warn!(datastore = %ds.name, error = %post_err, "post-run script failed too");
                        Err(e)
                    }
                    Ok(_) => Err(post_err),
                };
            }
        }

        single_measurement(bench?)
    }
}

#[async_trait]
impl UnitExecutor for RemoteUnitExecutor {
    async fn execute(&self, job: UnitJob<'_>) -> Result<Measurement, UnitError> {
        let mut env = job.worker.exec.connect().await.map_err(UnitError::Env)?;
        debug!(backend = env.name(), work_dir = env.work_dir(), "environment ready");

        let res = self.run_in(env.as_ref(), &job).await;

        if let Err(e) = env.close().await {
            warn!(backend = env.name(), error = %e, "failed to clean up environment");
        }
        res
    }
}

fn stage(res: anyhow::Result<()>, file: &str) -> Result<(), UnitError> {
    res.map_err(|source| UnitError::Stage {
        file: file.to_string(),
        source,
    })
}

async fn run_script(env: &dyn ExecEnv, name: &str, script: &ScriptSpec) -> anyhow::Result<()> {
    let line = format!("./{} {}", name, script.args);
    env.command(
        "/usr/bin/env",
        &["bash".to_string(), "-c".to_string(), line],
        env::stdout_sink(),
        env::stderr_sink(),
    )
    .run()
    .await
}

/// Run the benchmark program and parse its report while it is produced.
async fn run_benchmark(env: &dyn ExecEnv, datastore: &str) -> Result<ReportSet, UnitError> {
    let args = vec![
        "-test.benchmem".to_string(),
        "-test.bench".to_string(),
        crate::defaults::BENCH_ENTRY.to_string(),
    ];

    let (reader, writer) = os_pipe::pipe()
        .context("failed to create report pipe")
        .map_err(UnitError::Env)?;
    let cmd = env.command(
        &format!("./{}", staged::WORKER),
        &args,
        Box::new(writer),
        env::stderr_sink(),
    );
    info!(datastore, command = cmd.description(), "starting benchmark");

    // the parser sees EOF once the command drops its stdout sink
    let parser = tokio::task::spawn_blocking(move || {
        report::parse_set(BufReader::new(TeeReader::new(reader, std::io::stderr())))
    });

    let (run, parsed) = tokio::join!(cmd.run(), parser);
    debug!(datastore, "benchmark exited");

    let parsed = parsed.context("report parser panicked").map_err(UnitError::Env)?;
    benchmark_outcome(run, parsed)
}

/// Combine the exit of the benchmark program with the parser result.
///
/// A parser failure closes the pipe, which then also shows up as a failed
/// run; the parser error is the one reported.
fn benchmark_outcome(
    run: anyhow::Result<()>,
    parsed: Result<ReportSet, ReportError>,
) -> Result<ReportSet, UnitError> {
    let set = parsed?;
    run.map_err(UnitError::Benchmark)?;
    Ok(set)
}

/// Reduce a report to its only line.
pub fn single_measurement(set: ReportSet) -> Result<Measurement, UnitError> {
    if set.len() != 1 {
        return Err(UnitError::UnexpectedBenchCount(set.len()));
    }

    let mut group = set.into_values().next().unwrap_or_default();
    if group.len() != 1 {
        return Err(UnitError::UnexpectedBenchLen(group.len()));
    }
    Ok(group.remove(0))
}

/// Reader that copies everything it reads into a writer.
struct TeeReader<R, W> {
    inner: R,
    copy: W,
}

impl<R, W> TeeReader<R, W> {
    fn new(inner: R, copy: W) -> Self {
        Self { inner, copy }
    }
}

impl<R: Read, W: Write> Read for TeeReader<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        // diagnostics only; a failing copy must not break parsing
        let _ = self.copy.write_all(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BenchOptions;
    use std::collections::BTreeMap;

    fn report(text: &str) -> ReportSet {
        report::parse_set(text.as_bytes()).unwrap()
    }

    #[test]
    fn test_single_measurement_accepts_one_line() {
        let set = report(
            "goos: linux\nBenchmarkSpec/pre=1-size=1024-batch=1-8 \t 1000 \t 2514 ns/op \t 1184 B/op \t 9 allocs/op\nPASS\n",
        );
        let m = single_measurement(set).unwrap();
        assert_eq!(m.n, 1000);
        assert_eq!(m.ns_per_op, 2514.0);
        assert_eq!(m.allocs_per_op, 9);
    }

    #[test]
    fn test_single_measurement_rejects_empty_report() {
        let err = single_measurement(report("PASS\n")).unwrap_err();
        assert!(matches!(err, UnitError::UnexpectedBenchCount(0)));
        assert_eq!(err.to_string(), "unexpected bench count: 0");
    }

    #[test]
    fn test_single_measurement_rejects_two_groups() {
        let set = report(
            "BenchmarkSpec/a-8 10 1 ns/op\nBenchmarkSpec/b-8 10 2 ns/op\n",
        );
        assert!(matches!(
            single_measurement(set),
            Err(UnitError::UnexpectedBenchCount(2))
        ));
    }

    #[test]
    fn test_single_measurement_rejects_repeated_line() {
        let set = report("BenchmarkSpec/a-8 10 1 ns/op\nBenchmarkSpec/a-8 10 2 ns/op\n");
        assert!(matches!(
            single_measurement(set),
            Err(UnitError::UnexpectedBenchLen(2))
        ));
    }

    #[test]
    fn test_parser_failure_wins_over_broken_pipe() {
        let broken = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "stream did not contain valid UTF-8",
        );
        let err = benchmark_outcome(
            Err(anyhow::anyhow!("failed to forward stdout")),
            Err(ReportError::Read(broken)),
        )
        .unwrap_err();
        assert!(matches!(err, UnitError::Report(_)));

        let err = benchmark_outcome(Err(anyhow::anyhow!("exit status: 1")), Ok(ReportSet::new()))
            .unwrap_err();
        assert!(matches!(err, UnitError::Benchmark(_)));

        let set = report("BenchmarkSpec-8 10 1 ns/op\n");
        assert_eq!(benchmark_outcome(Ok(()), Ok(set)).unwrap().len(), 1);
    }

    #[test]
    fn test_unit_spec_applies_worker_vars() {
        let mut ds = WorkerDatastore::new("flatfs", "flatfs");
        ds.params.insert("Path".into(), serde_json::json!("$DIR/ds"));
        let worker = Worker {
            exec: env::ExecutionConfig::Local,
            vars: BTreeMap::from([("$DIR".to_string(), "/mnt/a".to_string())]),
        };
        let series = Series::new(
            "get",
            "get",
            vec![BenchOptions::new(1, 1024, 1), BenchOptions::new(2, 1024, 1)],
        );

        let job = UnitJob {
            worker: &worker,
            datastore: &ds,
            series: &series,
            point: 1,
        };
        let spec = job.test_spec().unwrap();
        assert_eq!(spec.options, BenchOptions::new(2, 1024, 1));
        assert_eq!(spec.test, "get");
        assert_eq!(spec.datastore.params["Path"], serde_json::json!("/mnt/a/ds"));

        let out_of_range = UnitJob { point: 2, ..job };
        assert!(out_of_range.test_spec().is_err());
    }

    #[test]
    fn test_tee_reader_copies_stream() {
        let mut copy = Vec::new();
        let mut out = String::new();
        TeeReader::new("line one\nline two\n".as_bytes(), &mut copy)
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "line one\nline two\n");
        assert_eq!(copy, out.as_bytes());
    }
}
