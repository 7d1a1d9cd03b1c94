//! # Error Types
//!
//! Typed errors for the parts of the coordinator whose failure modes callers
//! need to distinguish. Everything else propagates as `anyhow::Error` with
//! context attached at the failing call site.
//!
//! The taxonomy follows how a failure affects a running batch:
//!
//! - [`BatchError`]: fatal to the whole batch, raised before dispatch begins
//! - [`UnitError`]: fatal to one work unit only; the batch keeps going and the
//!   point stays outstanding for the next resume
//! - [`ReportError`]: malformed output from the benchmark program

use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Errors that abort a batch before any work is dispatched.
#[derive(Error, Debug)]
pub enum BatchError {
    /// A checkpoint is already present and resuming was not requested.
    #[error("results for this bench already exist: {0}")]
    Exists(PathBuf),

    #[error("checkpoint I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed batch document {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid batch template: {0}")]
    InvalidTemplate(String),
}

impl BatchError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

/// Which helper script of a datastore failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptStage {
    PreRun,
    PostRun,
}

impl std::fmt::Display for ScriptStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptStage::PreRun => write!(f, "pre-run"),
            ScriptStage::PostRun => write!(f, "post-run"),
        }
    }
}

/// Errors that abort a single work unit.
#[derive(Error, Debug)]
pub enum UnitError {
    #[error("no workers of instance type {0} are configured")]
    UnknownInstanceType(String),

    #[error("failed to stage {file}: {source}")]
    Stage {
        file: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{stage} script failed: {source}")]
    Script {
        stage: ScriptStage,
        #[source]
        source: anyhow::Error,
    },

    #[error("benchmark program failed: {0}")]
    Benchmark(#[source] anyhow::Error),

    #[error("malformed benchmark report: {0}")]
    Report(#[from] ReportError),

    #[error("unexpected bench count: {0}")]
    UnexpectedBenchCount(usize),

    #[error("unexpected bench len: {0}")]
    UnexpectedBenchLen(usize),

    #[error("execution environment error: {0}")]
    Env(#[from] anyhow::Error),
}

/// Errors raised while parsing a benchmark report.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to read report stream: {0}")]
    Read(#[from] std::io::Error),
}

/// Turn a non-successful exit status into an error.
pub(crate) fn check_status(status: ExitStatus) -> anyhow::Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("process exited with {}", status))
    }
}
