//! # Configuration
//!
//! Two layers of configuration exist:
//!
//! - [`CoordinatorConfig`]: where the coordinator keeps its files, taken from
//!   the command line
//! - [`BatchTemplate`]: the description of a fresh batch, read from a JSON
//!   file and turned into a [`BatchSpec`] when no checkpoint exists yet
//!
//! ## Batch template
//!
//! ```json
//! {
//!   "datastores": [
//!     { "Type": "flatfs", "Name": "flatfs-nosync", "Tags": ["disk"],
//!       "Params": { "Path": "$DISK/flatfs", "Sync": false } }
//!   ],
//!   "workers": {
//!     "m5.large": [
//!       { "exec": { "type": "ssh", "addr": "10.0.0.5:22", "user": "bench",
//!                   "key_file": "/home/me/.ssh/bench" },
//!         "vars": { "$DISK": "/mnt/nvme0" } }
//!     ]
//!   },
//!   "jobs": {
//!     "m5.large": [
//!       { "test": "get", "plot_name": "get-all-default", "opts": "default" },
//!       { "test": "add-batch", "plot_name": "add-batch-size",
//!         "opts": { "range2pow": { "start": { "PrimeRecordCount": 1024, "RecordSize": 1024, "BatchSize": 1 },
//!                                  "end":   { "PrimeRecordCount": 1024, "RecordSize": 1024, "BatchSize": 1024 },
//!                                  "count_per_axis": 6 } } }
//!     ]
//!   },
//!   "exclude_tags": ["slow"]
//! }
//! ```

use crate::batch::{BatchSpec, Worker};
use crate::error::BatchError;
use crate::options::{self, BenchOptions, DsFilter, WorkerDatastore};
use crate::plot::PlotFormat;
use crate::series::Series;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// File locations used by one coordinator run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Batch checkpoint, rewritten after every completed unit
    pub checkpoint: PathBuf,
    /// Root of the standard plot tree
    pub plot_dir: PathBuf,
    /// Benchmark program staged into every scratch directory
    pub worker_bin: PathBuf,
    /// Continue from an existing checkpoint instead of refusing to start
    pub resume: bool,
    /// Format of the generated charts
    #[serde(default)]
    pub plot_format: PlotFormat,
    /// Also write every series as `<dir>/<instance type>/results-<PlotName>.json`
    #[serde(default)]
    pub series_dir: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            checkpoint: PathBuf::from(crate::defaults::CHECKPOINT_FILE),
            plot_dir: PathBuf::from(crate::defaults::PLOT_DIR),
            worker_bin: PathBuf::from(crate::defaults::WORKER_BIN),
            resume: false,
            plot_format: PlotFormat::default(),
            series_dir: None,
        }
    }
}

impl CoordinatorConfig {
    /// Resolve `worker_bin` against the current directory.
    ///
    /// Done once at start-up so the path stays valid no matter which
    /// directory units later run in.
    pub fn resolved(mut self) -> Result<Self> {
        self.worker_bin = crate::utils::absolute_path(&self.worker_bin)?;
        Ok(self)
    }
}

/// Parameter points of a series template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptsTemplate {
    /// Explicit list of points
    Points(Vec<BenchOptions>),
    /// A predefined sweep, by name
    Named(NamedSweep),
    /// A power-of-two spaced sweep
    Range { range2pow: RangeTemplate },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamedSweep {
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeTemplate {
    pub start: BenchOptions,
    pub end: BenchOptions,
    pub count_per_axis: usize,
}

impl Default for OptsTemplate {
    fn default() -> Self {
        OptsTemplate::Named(NamedSweep::Default)
    }
}

impl OptsTemplate {
    pub fn expand(&self) -> Vec<BenchOptions> {
        match self {
            OptsTemplate::Points(points) => points.clone(),
            OptsTemplate::Named(NamedSweep::Default) => options::default_bench_opts(),
            OptsTemplate::Range { range2pow: r } => {
                options::options_range_2pow(r.start, r.end, r.count_per_axis)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesTemplate {
    pub test: String,
    pub plot_name: String,
    #[serde(default)]
    pub opts: OptsTemplate,
}

/// Description of a fresh batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTemplate {
    pub datastores: Vec<WorkerDatastore>,
    #[serde(default)]
    pub workers: BTreeMap<String, Vec<Worker>>,
    #[serde(default)]
    pub jobs: BTreeMap<String, Vec<SeriesTemplate>>,
    /// Datastores carrying any of these tags are left out
    #[serde(default)]
    pub exclude_tags: Vec<String>,
}

impl BatchTemplate {
    pub fn load(path: &Path) -> Result<Self, BatchError> {
        let data = std::fs::read(path).map_err(|e| BatchError::io(path, e))?;
        serde_json::from_slice(&data).map_err(|e| BatchError::json(path, e))
    }

    /// Build the batch, applying `exclude_tags` and then `filters` to the
    /// datastore list.
    pub fn into_batch(self, filters: Vec<DsFilter>) -> Result<BatchSpec, BatchError> {
        let mut all: Vec<DsFilter> = self.exclude_tags.iter().map(options::no_tag).collect();
        all.extend(filters);

        let before = self.datastores.len();
        let datastores = options::apply_filters(&all, self.datastores);
        if datastores.len() != before {
            debug!(
                dropped = before - datastores.len(),
                "datastores removed by filters"
            );
        }
        if datastores.is_empty() {
            return Err(BatchError::InvalidTemplate(
                "no datastores left after filtering".to_string(),
            ));
        }

        let mut jobs = BTreeMap::new();
        for (itype, templates) in self.jobs {
            if !self.workers.contains_key(&itype) {
                warn!(instance_type = %itype, "jobs configured for instance type without workers");
            }

            let mut names = HashSet::new();
            let mut series = Vec::with_capacity(templates.len());
            for t in templates {
                if !names.insert(t.plot_name.clone()) {
                    return Err(BatchError::InvalidTemplate(format!(
                        "duplicate plot name {:?} for instance type {}",
                        t.plot_name, itype
                    )));
                }
                let opts = t.opts.expand();
                if opts.is_empty() {
                    return Err(BatchError::InvalidTemplate(format!(
                        "series {:?} has no parameter points",
                        t.plot_name
                    )));
                }
                series.push(Arc::new(Series::new(t.test, t.plot_name, opts)));
            }
            jobs.insert(itype, series);
        }

        let batch = BatchSpec {
            datastores,
            workers: self.workers,
            jobs,
        };
        batch.validate()?;
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::ExecutionConfig;

    const TEMPLATE: &str = r#"{
        "datastores": [
            { "Type": "memory-map", "Name": "memory-map", "Tags": ["memory"] },
            { "Type": "flatfs", "Name": "flatfs", "Params": { "Path": "$DISK/ds" } }
        ],
        "workers": {
            "local": [ { "exec": { "type": "local" }, "vars": { "$DISK": "/tmp" } } ]
        },
        "jobs": {
            "local": [
                { "test": "get", "plot_name": "get-all-default" },
                { "test": "get", "plot_name": "get-two",
                  "opts": [ { "PrimeRecordCount": 1, "RecordSize": 1024, "BatchSize": 1 },
                            { "PrimeRecordCount": 2, "RecordSize": 1024, "BatchSize": 1 } ] },
                { "test": "add-batch", "plot_name": "batch-range",
                  "opts": { "range2pow": {
                      "start": { "PrimeRecordCount": 0, "RecordSize": 1024, "BatchSize": 0 },
                      "end":   { "PrimeRecordCount": 0, "RecordSize": 1024, "BatchSize": 64 },
                      "count_per_axis": 3 } } }
            ]
        },
        "exclude_tags": ["memory"]
    }"#;

    #[test]
    fn test_template_into_batch() {
        let template: BatchTemplate = serde_json::from_str(TEMPLATE).unwrap();
        let batch = template.into_batch(Vec::new()).unwrap();

        let names: Vec<&str> = batch.datastores.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["flatfs"]);
        assert_eq!(batch.workers["local"][0].exec, ExecutionConfig::Local);
        assert_eq!(batch.workers["local"][0].vars["$DISK"], "/tmp");

        let series = &batch.jobs["local"];
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].opts, options::default_bench_opts());
        assert_eq!(series[1].opts.len(), 2);
        // axis [0.25, 0.5, 1.0] over batch sizes 0..64
        let batches: Vec<u64> = series[2].opts.iter().map(|o| o.batch_size).collect();
        assert_eq!(batches, vec![16, 32, 64]);
    }

    #[test]
    fn test_extra_filters_apply_after_exclusions() {
        let template: BatchTemplate = serde_json::from_str(TEMPLATE).unwrap();
        let drop_all: DsFilter = Box::new(|_| Vec::new());
        let res = template.into_batch(vec![options::no_tag("unused"), drop_all]);
        assert!(matches!(res, Err(BatchError::InvalidTemplate(_))));
    }

    #[test]
    fn test_duplicate_plot_names_rejected() {
        let mut template: BatchTemplate = serde_json::from_str(TEMPLATE).unwrap();
        let first = template.jobs["local"][0].clone();
        template.jobs.get_mut("local").unwrap().push(first);
        assert!(matches!(
            template.into_batch(Vec::new()),
            Err(BatchError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn test_empty_point_list_rejected() {
        let mut template: BatchTemplate = serde_json::from_str(TEMPLATE).unwrap();
        template.jobs.get_mut("local").unwrap()[1].opts = OptsTemplate::Points(Vec::new());
        assert!(template.into_batch(Vec::new()).is_err());
    }

    #[test]
    fn test_coordinator_config_defaults() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.checkpoint, PathBuf::from("results.json"));
        assert_eq!(cfg.plot_dir, PathBuf::from("x_plots"));
        assert!(!cfg.resume);

        let resolved = cfg.resolved().unwrap();
        assert!(resolved.worker_bin.is_absolute());
        assert!(resolved.worker_bin.ends_with("worker.test"));
    }
}
