//! # Batch Specification and Checkpoints
//!
//! A [`BatchSpec`] is everything a run needs: the datastores under test, the
//! worker machines of every instance type and the series each instance type
//! runs. The whole structure, partial results included, is the checkpoint
//! that gets rewritten after every completed work unit.
//!
//! ## Checkpoint format
//!
//! A single JSON document:
//!
//! ```json
//! {
//!   "version": "0.2.0",
//!   "saved_at": "2024-05-01T10:00:00Z",
//!   "datastores": [ ... ],
//!   "workers": { "m5.large": [ { "exec": { "type": "local" }, "vars": {} } ] },
//!   "jobs": { "m5.large": [ { "test": "get", "plot_name": "...", "opts": [...], "results": { "flatfs": { "0": { ... } } } } ] }
//! }
//! ```
//!
//! `version` and `saved_at` are informational and ignored on load. Writes go
//! to a sibling temp file that is renamed over the checkpoint.

use crate::env::ExecutionConfig;
use crate::error::BatchError;
use crate::options::WorkerDatastore;
use crate::series::{ResultMap, Series, SeriesRef};
use parking_lot::MutexGuard;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// One worker machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub exec: ExecutionConfig,
    /// Template variables substituted into datastore parameters and script
    /// arguments before a unit runs on this machine
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl Worker {
    pub fn local() -> Self {
        Self {
            exec: ExecutionConfig::Local,
            vars: BTreeMap::new(),
        }
    }
}

/// Identifies one point to run, scoped to one instance type's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkUnit {
    /// Index into the instance type's series list
    pub series: usize,
    /// Index into [`BatchSpec::datastores`]
    pub datastore: usize,
    /// Index into the series' parameter points
    pub point: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BatchSpec {
    pub datastores: Vec<WorkerDatastore>,
    /// instance type -> worker machines
    #[serde(default)]
    pub workers: BTreeMap<String, Vec<Worker>>,
    /// instance type -> series
    #[serde(default)]
    pub jobs: BTreeMap<String, Vec<Arc<Series>>>,
}

#[derive(Serialize)]
struct CheckpointRef<'a> {
    version: &'static str,
    saved_at: chrono::DateTime<chrono::Utc>,
    datastores: &'a [WorkerDatastore],
    workers: &'a BTreeMap<String, Vec<Worker>>,
    jobs: BTreeMap<&'a str, Vec<SeriesRef<'a>>>,
}

impl BatchSpec {
    /// Reject batches whose datastore names are not unique.
    pub fn validate(&self) -> Result<(), BatchError> {
        let mut seen = HashSet::new();
        for ds in &self.datastores {
            if !seen.insert(ds.name.as_str()) {
                return Err(BatchError::InvalidTemplate(format!(
                    "duplicate datastore name {:?}",
                    ds.name
                )));
            }
        }
        Ok(())
    }

    /// Every outstanding work unit of `instance_type`, in enqueue order:
    /// datastores, then series, then points.
    pub fn work_units(&self, instance_type: &str) -> Vec<WorkUnit> {
        let Some(series) = self.jobs.get(instance_type) else {
            return Vec::new();
        };

        let mut units = Vec::new();
        for (datastore, ds) in self.datastores.iter().enumerate() {
            for (sid, s) in series.iter().enumerate() {
                units.extend(s.todo(&ds.name).into_iter().map(|point| WorkUnit {
                    series: sid,
                    datastore,
                    point,
                }));
            }
        }
        units
    }

    pub fn series(&self, instance_type: &str, index: usize) -> Option<&Arc<Series>> {
        self.jobs.get(instance_type).and_then(|s| s.get(index))
    }

    /// Total number of parameter points across all instance types and datastores.
    pub fn total_points(&self) -> usize {
        self.jobs
            .values()
            .flatten()
            .map(|s| s.opts.len() * self.datastores.len())
            .sum()
    }

    /// Serialize the whole batch while holding every series lock.
    ///
    /// Locks are taken in a fixed order (instance types in key order, then
    /// series in list order) and a series shared by several instance types is
    /// locked once.
    pub fn to_checkpoint_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut order: Vec<&Series> = Vec::new();
        let mut slot: HashMap<*const Series, usize> = HashMap::new();
        for series in self.jobs.values().flatten() {
            let ptr = Arc::as_ptr(series);
            if !slot.contains_key(&ptr) {
                slot.insert(ptr, order.len());
                order.push(series);
            }
        }

        let guards: Vec<MutexGuard<'_, ResultMap>> = order.iter().map(|s| s.lock()).collect();

        let jobs = self
            .jobs
            .iter()
            .map(|(itype, series)| {
                let refs = series
                    .iter()
                    .map(|s| s.as_ref_with(&guards[slot[&Arc::as_ptr(s)]]))
                    .collect();
                (itype.as_str(), refs)
            })
            .collect();

        serde_json::to_vec_pretty(&CheckpointRef {
            version: crate::VERSION,
            saved_at: chrono::Utc::now(),
            datastores: &self.datastores,
            workers: &self.workers,
            jobs,
        })
    }

    /// Persist the batch to `path`, replacing any previous checkpoint.
    pub fn save(&self, path: &Path) -> Result<(), BatchError> {
        let json = self
            .to_checkpoint_json()
            .map_err(|e| BatchError::json(path, e))?;
        write_atomic(path, &json)?;
        debug!(
            path = %path.display(),
            size = %crate::utils::format_bytes(json.len() as u64),
            "checkpoint saved"
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, BatchError> {
        let data = std::fs::read(path).map_err(|e| BatchError::io(path, e))?;
        let spec: BatchSpec =
            serde_json::from_slice(&data).map_err(|e| BatchError::json(path, e))?;
        spec.validate()?;
        Ok(spec)
    }
}

/// Load or create the batch for a run.
///
/// - checkpoint present, `resume` set: continue from the checkpoint
/// - checkpoint present, `resume` unset: [`BatchError::Exists`]
/// - no checkpoint: build a fresh batch with `new` and persist it right away
pub fn build_batch<F>(checkpoint: &Path, resume: bool, new: F) -> Result<BatchSpec, BatchError>
where
    F: FnOnce() -> Result<BatchSpec, BatchError>,
{
    if checkpoint.exists() {
        if !resume {
            return Err(BatchError::Exists(checkpoint.to_path_buf()));
        }
        info!(path = %checkpoint.display(), "continuing from existing results");
        return BatchSpec::load(checkpoint);
    }

    let spec = new()?;
    spec.validate()?;
    spec.save(checkpoint)?;
    Ok(spec)
}

/// Write `data` to a temp file next to `path`, flush it to disk and rename
/// it into place.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<(), BatchError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".checkpoint-")
        .tempfile_in(dir)
        .map_err(|e| BatchError::io(dir, e))?;
    tmp.write_all(data).map_err(|e| BatchError::io(tmp.path(), e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))
            .map_err(|e| BatchError::io(tmp.path(), e))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| BatchError::io(tmp.path(), e))?;

    tmp.persist(path).map_err(|e| BatchError::io(path, e.error))?;
    Ok(())
}
