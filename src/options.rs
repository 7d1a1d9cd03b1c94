//! # Benchmark Options and Datastore Definitions
//!
//! Value types shared between the coordinator and the benchmark program.
//!
//! The benchmark program reads a [`TestSpec`] from `spec.json` in its working
//! directory, so the types that end up in that file keep the field names the
//! program expects (`Datastore`, `Test`, `Options`, `PrimeRecordCount`, ...).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One parameter point of a benchmark series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BenchOptions {
    /// Number of records in the datastore before the test
    pub prime_record_count: u64,
    /// Size of one record
    pub record_size: u64,
    /// Size of the batch, only applies to batched operations
    pub batch_size: u64,
}

impl BenchOptions {
    pub const fn new(prime_record_count: u64, record_size: u64, batch_size: u64) -> Self {
        Self {
            prime_record_count,
            record_size,
            batch_size,
        }
    }

    /// Short description used as the sub-benchmark name by the benchmark program.
    pub fn test_desc(&self) -> String {
        format!(
            "pre={}-size={}-batch={}",
            self.prime_record_count, self.record_size, self.batch_size
        )
    }
}

/// A helper script staged next to the benchmark program.
///
/// `path` is a file on the coordinator's machine; `args` is appended to the
/// script invocation after template variable substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScriptSpec {
    pub path: PathBuf,
    #[serde(default)]
    pub args: String,
}

/// One candidate-under-test configuration.
///
/// `name` is unique within a batch and is the key every result is indexed by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkerDatastore {
    #[serde(rename = "Type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub pre_script: Option<ScriptSpec>,
    #[serde(default)]
    pub post_script: Option<ScriptSpec>,
    /// Datastore specific parameters, passed through to the benchmark program
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl WorkerDatastore {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            tags: Vec::new(),
            pre_script: None,
            post_script: None,
            params: BTreeMap::new(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Copy of this datastore with machine template variables substituted.
    ///
    /// Every occurrence of each key of `vars` is replaced by its value in
    /// string-valued parameters and in the script argument strings. Other
    /// parameter values are copied unchanged.
    pub fn with_vars(&self, vars: &BTreeMap<String, String>) -> Self {
        let mut ds = self.clone();
        if vars.is_empty() {
            return ds;
        }

        for value in ds.params.values_mut() {
            if let serde_json::Value::String(s) = value {
                *s = replace_vars(s, vars);
            }
        }
        for script in [&mut ds.pre_script, &mut ds.post_script]
            .into_iter()
            .flatten()
        {
            script.args = replace_vars(&script.args, vars);
        }
        ds
    }
}

/// Replace every occurrence of each key in `vars` by its value.
pub fn replace_vars(input: &str, vars: &BTreeMap<String, String>) -> String {
    vars.iter()
        .filter(|(from, _)| !from.is_empty())
        .fold(input.to_string(), |acc, (from, to)| acc.replace(from.as_str(), to))
}

/// The document written to `spec.json` for one benchmark invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestSpec {
    pub datastore: WorkerDatastore,
    /// Benchmark kind, e.g. `get` or `add-batch`
    pub test: String,
    pub options: BenchOptions,
}

/// The default parameter sweep: prime counts from 1 to 2^18, 25KiB records,
/// batches of 64.
pub fn default_bench_opts() -> Vec<BenchOptions> {
    options_range_2pow(
        BenchOptions::new(1, 25 << 10, 64),
        BenchOptions::new(1 << 18, 25 << 10, 64),
        8,
    )
}

/// Generate a power-of-two spaced sweep between `start` and `end`.
///
/// Each field that differs between `start` and `end` becomes an axis of
/// `count_per_axis` points; the result is the cross product of all axes, in
/// field order `PrimeRecordCount`, `RecordSize`, `BatchSize`.
pub fn options_range_2pow(
    start: BenchOptions,
    end: BenchOptions,
    count_per_axis: usize,
) -> Vec<BenchOptions> {
    let mut res = vec![start];
    if start == end || count_per_axis == 0 {
        return res;
    }

    let max_n = 2f64.powi(count_per_axis as i32);
    let mut axis: Vec<f64> = (0..count_per_axis - 1)
        .map(|i| 2f64.powi(i as i32 + 1) / max_n)
        .collect();
    axis.push(1.0);

    let scale = |from: u64, to: u64, s: f64| -> u64 {
        (((to as f64 - from as f64) * s) as i64 + from as i64) as u64
    };

    if start.prime_record_count != end.prime_record_count {
        res = expand(&res, &axis, |opt, s| {
            opt.prime_record_count = scale(start.prime_record_count, end.prime_record_count, s)
        });
    }
    if start.record_size != end.record_size {
        res = expand(&res, &axis, |opt, s| {
            opt.record_size = scale(start.record_size, end.record_size, s)
        });
    }
    if start.batch_size != end.batch_size {
        res = expand(&res, &axis, |opt, s| {
            opt.batch_size = scale(start.batch_size, end.batch_size, s)
        });
    }

    res
}

fn expand(
    base: &[BenchOptions],
    axis: &[f64],
    set: impl Fn(&mut BenchOptions, f64),
) -> Vec<BenchOptions> {
    let mut out = Vec::with_capacity(base.len() * axis.len());
    for opt in base {
        for &s in axis {
            let mut point = *opt;
            set(&mut point, s);
            out.push(point);
        }
    }
    out
}

/// A datastore filter, applied when a batch is built from a template.
pub type DsFilter = Box<dyn Fn(Vec<WorkerDatastore>) -> Vec<WorkerDatastore> + Send + Sync>;

/// Filter that drops every datastore carrying `tag`.
pub fn no_tag(tag: impl Into<String>) -> DsFilter {
    let tag = tag.into();
    Box::new(move |datastores| {
        datastores
            .into_iter()
            .filter(|ds| !ds.has_tag(&tag))
            .collect()
    })
}

pub fn apply_filters(filters: &[DsFilter], datastores: Vec<WorkerDatastore>) -> Vec<WorkerDatastore> {
    filters.iter().fold(datastores, |acc, f| f(acc))
}
