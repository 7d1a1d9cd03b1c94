//! # Distributed Datastore Benchmark Coordinator
//!
//! Runs a parameterized benchmark program against several datastore
//! configurations on pools of worker machines, collects the measurements and
//! derives comparative charts from them.
//!
//! ## Work model
//!
//! A batch is the cross product of instance type × datastore × series ×
//! parameter point. Each element is a work unit. Units are distributed
//! through one FIFO queue per instance type to one task per worker machine,
//! executed in a private scratch directory (locally or over SSH) and
//! recorded into their series as they complete.
//!
//! ## Resumability
//!
//! The whole batch, partial results included, is written to a checkpoint
//! after every completed unit. Results are keyed by `(datastore name, point
//! index)`, so a restarted run re-derives exactly the outstanding work from
//! the checkpoint. Units run at least once; re-running a point overwrites its
//! previous measurement.
//!
//! ## Architecture Overview
//!
//! - `options`: benchmark parameter points and datastore definitions
//! - `report`: parser for the benchmark program's text report
//! - `env`: execution environments (local temp dir, SSH host)
//! - `runner`: the per-unit execution procedure
//! - `queue`: the per-instance-type work queue
//! - `dispatcher`: worker tasks draining the queues
//! - `series`: per-series result maps and averaging
//! - `batch`: the batch structure and its checkpoint
//! - `coordinator`: top-level orchestration of a run
//! - `plot`: derivation of the standard chart tree
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use ds_bench::{BatchTemplate, Coordinator, CoordinatorConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CoordinatorConfig::default().resolved()?;
//!     let mut coordinator = Coordinator::build(config, || {
//!         BatchTemplate::load("batch.json".as_ref())?.into_batch(Vec::new())
//!     })?;
//!
//!     let summary = coordinator.start(CancellationToken::new()).await?;
//!     println!("{} units completed, {} failed", summary.completed, summary.failed);
//!     Ok(())
//! }
//! ```

/// Batch structure, checkpoint persistence and batch building
pub mod batch;

/// Command-line interface
///
/// Argument parsing with clap; converts the parsed flags into a
/// [`CoordinatorConfig`].
pub mod cli;

/// Batch templates and coordinator file locations
pub mod config;

/// Run orchestration
///
/// Drives a batch through building, dispatching and result collection and
/// regenerates the plots when done or cancelled.
pub mod coordinator;

/// Worker tasks, one per machine, grouped in pools by instance type
pub mod dispatcher;

/// Execution environments
///
/// The `ExecEnv` trait with a local and an SSH backend. Everything the
/// per-unit procedure does on a machine goes through this abstraction.
pub mod env;

pub mod error;

/// Console and file logging setup
pub mod logging;

/// Benchmark parameters and datastore definitions
///
/// Includes the wire format of `spec.json` as read by the benchmark program.
pub mod options;

/// Standard plot tree derivation and chart renderers
pub mod plot;

/// Work unit queue
pub mod queue;

/// Benchmark report parsing
pub mod report;

/// Per-unit execution procedure
pub mod runner;

/// Series of parameter points and their results
pub mod series;

pub mod utils;

pub use batch::{build_batch, BatchSpec, WorkUnit, Worker};
pub use cli::Args;
pub use config::{BatchTemplate, CoordinatorConfig};
pub use coordinator::{Coordinator, CoordinatorState, RunSummary};
pub use env::{ExecEnv, ExecutionConfig};
pub use error::{BatchError, ReportError, UnitError};
pub use options::{BenchOptions, TestSpec, WorkerDatastore};
pub use report::Measurement;
pub use runner::{RemoteUnitExecutor, UnitExecutor};
pub use series::Series;

/// The current version of the coordinator
///
/// Written into every checkpoint for debugging purposes.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// Default checkpoint file, relative to the working directory
    pub const CHECKPOINT_FILE: &str = "results.json";

    /// Default root of the standard plot tree
    pub const PLOT_DIR: &str = "x_plots";

    /// Default benchmark program, resolved to an absolute path at start-up
    pub const WORKER_BIN: &str = "./worker.test";

    /// Prefix of local scratch directories
    pub const SCRATCH_PREFIX: &str = "dsbench-";

    /// Benchmark entry point selected in the benchmark program
    ///
    /// The program runs one sub-benchmark named after the parameters read
    /// from `spec.json` below this entry point.
    pub const BENCH_ENTRY: &str = "BenchmarkSpec";
}
