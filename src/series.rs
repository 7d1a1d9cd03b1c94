//! # Series and Result Aggregation
//!
//! A [`Series`] is one benchmark kind swept over an ordered list of parameter
//! points. Its results are addressed by `(datastore name, point index)`; a
//! missing entry means the point is still to be measured. That addressing is
//! what makes an interrupted batch resumable: [`Series::todo`] re-derives the
//! outstanding work from whatever has been recorded so far.
//!
//! ## Locking
//!
//! Dispatcher workers of several instance types may complete points of the
//! same series concurrently, so the result map sits behind a per-series
//! mutex. Locks are never global; unrelated series make independent
//! progress. Batch checkpoints take every series lock in a fixed order (see
//! [`crate::batch::BatchSpec::save`]).

use crate::error::BatchError;
use crate::options::BenchOptions;
use crate::report::Measurement;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Point index -> measurement
pub type PointResults = BTreeMap<usize, Measurement>;

/// Datastore name -> measured points
pub type ResultMap = BTreeMap<String, PointResults>;

#[derive(Debug, Deserialize)]
#[serde(from = "SeriesFile")]
pub struct Series {
    /// Benchmark kind understood by the benchmark program (`get`, `add-batch`, ...)
    pub test: String,
    pub plot_name: String,
    pub opts: Vec<BenchOptions>,
    results: Mutex<ResultMap>,
}

/// Owned on-disk form of a series.
#[derive(Deserialize)]
struct SeriesFile {
    test: String,
    plot_name: String,
    opts: Vec<BenchOptions>,
    #[serde(default)]
    results: ResultMap,
}

impl From<SeriesFile> for Series {
    fn from(file: SeriesFile) -> Self {
        Self {
            test: file.test,
            plot_name: file.plot_name,
            opts: file.opts,
            results: Mutex::new(file.results),
        }
    }
}

/// Borrowed on-disk form of a series, built while its lock is held.
#[derive(Serialize)]
pub(crate) struct SeriesRef<'a> {
    test: &'a str,
    plot_name: &'a str,
    opts: &'a [BenchOptions],
    results: &'a ResultMap,
}

impl Serialize for Series {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let results = self.results.lock();
        self.as_ref_with(&results).serialize(serializer)
    }
}

impl Series {
    pub fn new(test: impl Into<String>, plot_name: impl Into<String>, opts: Vec<BenchOptions>) -> Self {
        Self {
            test: test.into(),
            plot_name: plot_name.into(),
            opts,
            results: Mutex::new(ResultMap::new()),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ResultMap> {
        self.results.lock()
    }

    pub(crate) fn as_ref_with<'a>(&'a self, results: &'a ResultMap) -> SeriesRef<'a> {
        SeriesRef {
            test: &self.test,
            plot_name: &self.plot_name,
            opts: &self.opts,
            results,
        }
    }

    /// Point indices not yet measured for `datastore`, in ascending order.
    ///
    /// Initializes the datastore's result map on first use.
    pub fn todo(&self, datastore: &str) -> Vec<usize> {
        let mut results = self.results.lock();
        let done = results.entry(datastore.to_string()).or_default();
        (0..self.opts.len())
            .filter(|point| !done.contains_key(point))
            .collect()
    }

    /// Store the measurement of one point. Returns `false` (and stores
    /// nothing) if `point` is outside the series.
    pub fn record(&self, datastore: &str, point: usize, measurement: Measurement) -> bool {
        if point >= self.opts.len() {
            warn!(
                series = %self.plot_name,
                datastore,
                point,
                "dropping measurement for unknown point"
            );
            return false;
        }
        self.results
            .lock()
            .entry(datastore.to_string())
            .or_default()
            .insert(point, measurement);
        true
    }

    pub fn results_for(&self, datastore: &str) -> PointResults {
        self.results
            .lock()
            .get(datastore)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of every recorded result.
    pub fn results(&self) -> ResultMap {
        self.results.lock().clone()
    }

    /// Number of recorded points across all datastores.
    pub fn completed(&self) -> usize {
        self.results.lock().values().map(|p| p.len()).sum()
    }

    /// Average measurements across the datastores of each category.
    ///
    /// For each category and point, every metric is the arithmetic mean over
    /// the datastores of that category that measured the point. Points no
    /// datastore measured are left out.
    pub fn average(&self, categories: &BTreeMap<String, ResultMap>) -> ResultMap {
        let mut out = ResultMap::new();

        for (category, items) in categories {
            let mut avg = PointResults::new();
            for point in 0..self.opts.len() {
                let benches: Vec<&Measurement> =
                    items.values().filter_map(|p| p.get(&point)).collect();
                if benches.is_empty() {
                    continue;
                }

                let count = benches.len() as f64;
                let mean_f = |f: fn(&Measurement) -> f64| {
                    benches.iter().map(|b| f(b)).sum::<f64>() / count
                };
                avg.insert(
                    point,
                    Measurement {
                        name: category.clone(),
                        ns_per_op: mean_f(|b| b.ns_per_op),
                        mb_per_s: mean_f(|b| b.mb_per_s),
                        alloced_bytes_per_op: mean_f(|b| b.alloced_bytes_per_op as f64) as u64,
                        allocs_per_op: mean_f(|b| b.allocs_per_op as f64) as u64,
                        measured: benches.iter().fold(0, |acc, b| acc | b.measured),
                        ..Default::default()
                    },
                );
            }
            out.insert(category.clone(), avg);
        }

        out
    }

    /// File name used when a series is persisted on its own.
    pub fn results_file_name(&self) -> String {
        format!("results-{}.json", self.plot_name)
    }

    /// Persist this series as `results-<PlotName>.json` inside `dir`.
    pub fn save_to(&self, dir: &Path) -> Result<PathBuf, BatchError> {
        let path = dir.join(self.results_file_name());
        let json = serde_json::to_vec_pretty(self).map_err(|e| BatchError::json(&path, e))?;
        crate::batch::write_atomic(&path, &json)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Series, BatchError> {
        let data = std::fs::read(path).map_err(|e| BatchError::io(path, e))?;
        serde_json::from_slice(&data).map_err(|e| BatchError::json(path, e))
    }
}
