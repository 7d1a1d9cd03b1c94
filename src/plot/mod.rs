//! # Standard Plots
//!
//! Charts are derived from the final result maps and never feed back into
//! the batch, so they can be regenerated from a checkpoint at any time.
//!
//! ## Tree layout
//!
//! ```text
//! <root>/<instance type>/<PlotName>/...          every datastore
//! <root>/<instance type>/tag-<tag>/<PlotName>/   datastores carrying <tag>
//! <root>/<instance type>/ds-<type>/<PlotName>/   datastores of one type
//! <root>/<instance type>/tag--avg/<PlotName>/    one averaged line per tag
//! <root>/<instance type>/ds--avg/<PlotName>/     one averaged line per type
//! ```
//!
//! Every directory gets the same chart set: four metrics, each once on a
//! linear and once on a log scale, all against the prime record count.
//! Points of a line sharing an x value are reduced to their mean, with an
//! error bar of half the sample standard deviation in each direction.
//!
//! Drawing is left to a [`PlotRenderer`]. [`SvgChartRenderer`] draws the
//! chart images; [`JsonChartRenderer`] writes the chart data as JSON for
//! external tooling.

use crate::batch::BatchSpec;
use crate::options::BenchOptions;
use crate::report::Measurement;
use crate::series::{ResultMap, Series};
use crate::utils::mean_std_dev;
use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub mod svg;

pub use svg::SvgChartRenderer;

/// Label of the x axis shared by every chart
pub const X_AXIS: &str = "prime-count";

/// Y axis of a chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    NsPerOp,
    AllocsPerOp,
    AllocKBsPerOp,
    MBPerS,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::NsPerOp,
        Metric::AllocsPerOp,
        Metric::AllocKBsPerOp,
        Metric::MBPerS,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Metric::NsPerOp => "ns/op",
            Metric::AllocsPerOp => "alloc/op",
            Metric::AllocKBsPerOp => "allocKBs/op",
            Metric::MBPerS => "MB/s",
        }
    }

    pub fn value(self, m: &Measurement) -> f64 {
        match self {
            Metric::NsPerOp => m.ns_per_op,
            Metric::AllocsPerOp => m.allocs_per_op as f64,
            Metric::AllocKBsPerOp => m.alloced_bytes_per_op as f64 / 1024.0,
            Metric::MBPerS => m.mb_per_s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scale {
    Linear,
    Log,
}

impl Scale {
    pub fn suffix(self) -> &'static str {
        match self {
            Scale::Linear => "",
            Scale::Log => "-log",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub x: f64,
    pub y: f64,
    /// Distance of the error bar ends from `y`
    pub y_err: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartLine {
    pub label: String,
    /// Sorted by ascending x
    pub points: Vec<ChartPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chart {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub y_scale: Scale,
    pub lines: Vec<ChartLine>,
}

impl Chart {
    /// File name stem, e.g. `prime-count-nsop-log`.
    pub fn file_stem(&self) -> String {
        format!("{}-{}{}", self.x_label, self.y_label, self.y_scale.suffix()).replace('/', "")
    }
}

/// Draws a chart to a file.
pub trait PlotRenderer: Send + Sync {
    /// File extension of the output, without the dot
    fn extension(&self) -> &'static str;

    fn render(&self, chart: &Chart, path: &Path) -> Result<()>;
}

/// Output format of the plot tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PlotFormat {
    /// Chart images
    #[default]
    Svg,
    /// Chart data
    Json,
}

impl PlotFormat {
    pub fn renderer(self) -> Arc<dyn PlotRenderer> {
        match self {
            PlotFormat::Svg => Arc::new(SvgChartRenderer),
            PlotFormat::Json => Arc::new(JsonChartRenderer),
        }
    }
}

/// Writes the chart data itself as pretty-printed JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonChartRenderer;

impl PlotRenderer for JsonChartRenderer {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn render(&self, chart: &Chart, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(chart)?;
        std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
    }
}

/// Build one chart: a line per result map entry, x = prime record count.
pub fn derive_chart(
    title: &str,
    opts: &[BenchOptions],
    results: &ResultMap,
    metric: Metric,
    scale: Scale,
) -> Chart {
    let lines = results
        .iter()
        .map(|(label, points)| {
            let mut by_x: BTreeMap<u64, Vec<f64>> = BTreeMap::new();
            for (&point, m) in points {
                if let Some(opt) = opts.get(point) {
                    by_x.entry(opt.prime_record_count)
                        .or_default()
                        .push(metric.value(m));
                }
            }

            let points = by_x
                .into_iter()
                .map(|(x, ys)| {
                    let (y, std_dev) = mean_std_dev(&ys);
                    ChartPoint {
                        x: x as f64,
                        y,
                        y_err: std_dev / 2.0,
                        samples: ys.len(),
                    }
                })
                .collect();

            ChartLine {
                label: label.clone(),
                points,
            }
        })
        .collect();

    Chart {
        title: title.to_string(),
        x_label: X_AXIS.to_string(),
        y_label: metric.name().to_string(),
        y_scale: scale,
        lines,
    }
}

/// The eight charts of one series over one set of results.
pub fn chart_set(plot_name: &str, opts: &[BenchOptions], results: &ResultMap) -> Vec<Chart> {
    Metric::ALL
        .iter()
        .flat_map(|&metric| {
            [Scale::Linear, Scale::Log]
                .into_iter()
                .map(move |scale| derive_chart(plot_name, opts, results, metric, scale))
        })
        .collect()
}

/// A chart together with the file it is rendered to.
#[derive(Debug)]
pub struct PlotJob {
    pub path: PathBuf,
    pub chart: Chart,
}

fn push_set(jobs: &mut Vec<PlotJob>, dir: &Path, series: &Series, results: &ResultMap, ext: &str) {
    let dir = dir.join(&series.plot_name);
    for chart in chart_set(&series.plot_name, &series.opts, results) {
        let path = dir.join(format!("{}.{}", chart.file_stem(), ext));
        jobs.push(PlotJob { path, chart });
    }
}

/// Every chart of the standard tree under `root`.
pub fn standard_plot_jobs(batch: &BatchSpec, root: &Path, ext: &str) -> Vec<PlotJob> {
    let mut jobs = Vec::new();

    for (itype, series_list) in &batch.jobs {
        let base = root.join(itype);

        for series in series_list {
            let results = series.results();
            push_set(&mut jobs, &base, series, &results, ext);

            let mut tagged: BTreeMap<String, ResultMap> = BTreeMap::new();
            let mut typed: BTreeMap<String, ResultMap> = BTreeMap::new();
            for ds in &batch.datastores {
                let points = results.get(&ds.name).cloned().unwrap_or_default();
                typed
                    .entry(ds.kind.clone())
                    .or_default()
                    .insert(ds.name.clone(), points.clone());
                for tag in &ds.tags {
                    tagged
                        .entry(tag.clone())
                        .or_default()
                        .insert(ds.name.clone(), points.clone());
                }
            }

            for (tag, res) in &tagged {
                push_set(&mut jobs, &base.join(format!("tag-{}", tag)), series, res, ext);
            }
            for (kind, res) in &typed {
                push_set(&mut jobs, &base.join(format!("ds-{}", kind)), series, res, ext);
            }
            push_set(&mut jobs, &base.join("tag--avg"), series, &series.average(&tagged), ext);
            push_set(&mut jobs, &base.join("ds--avg"), series, &series.average(&typed), ext);
        }
    }

    jobs
}

/// Regenerate the standard plot tree under `root`. Returns the number of
/// charts written.
pub fn standard_plots(batch: &BatchSpec, root: &Path, renderer: &dyn PlotRenderer) -> Result<usize> {
    let jobs = standard_plot_jobs(batch, root, renderer.extension());

    let mut dirs: Vec<&Path> = jobs.iter().filter_map(|j| j.path.parent()).collect();
    dirs.sort_unstable();
    dirs.dedup();
    for dir in dirs {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create plot directory {}", dir.display()))?;
    }

    jobs.par_iter().try_for_each(|job| {
        debug!(path = %job.path.display(), "rendering chart");
        renderer.render(&job.chart, &job.path)
    })?;

    info!(root = %root.display(), charts = jobs.len(), "plots regenerated");
    Ok(jobs.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Worker;
    use crate::options::WorkerDatastore;
    use crate::series::PointResults;

    fn m(ns: f64, bytes: u64) -> Measurement {
        Measurement {
            name: "BenchmarkSpec".into(),
            ns_per_op: ns,
            alloced_bytes_per_op: bytes,
            ..Default::default()
        }
    }

    #[test]
    fn test_file_stems_strip_slashes() {
        let opts = [BenchOptions::new(1, 1, 1)];
        let stems: Vec<String> = chart_set("get", &opts, &ResultMap::new())
            .iter()
            .map(Chart::file_stem)
            .collect();
        assert_eq!(
            stems,
            vec![
                "prime-count-nsop",
                "prime-count-nsop-log",
                "prime-count-allocop",
                "prime-count-allocop-log",
                "prime-count-allocKBsop",
                "prime-count-allocKBsop-log",
                "prime-count-MBs",
                "prime-count-MBs-log",
            ]
        );
    }

    #[test]
    fn test_points_with_same_x_are_reduced() {
        // two points share a prime count of 4
        let opts = [
            BenchOptions::new(4, 1024, 1),
            BenchOptions::new(4, 2048, 1),
            BenchOptions::new(1, 1024, 1),
        ];
        let results = ResultMap::from([(
            "flatfs".to_string(),
            PointResults::from([(0, m(10.0, 0)), (1, m(20.0, 0)), (2, m(5.0, 2048))]),
        )]);

        let chart = derive_chart("get", &opts, &results, Metric::NsPerOp, Scale::Linear);
        let line = &chart.lines[0];
        assert_eq!(line.label, "flatfs");
        assert_eq!(line.points.len(), 2);
        assert_eq!(line.points[0].x, 1.0);
        assert_eq!(line.points[0].y_err, 0.0);
        assert_eq!(line.points[1].x, 4.0);
        assert_eq!(line.points[1].y, 15.0);
        assert!((line.points[1].y_err - 50f64.sqrt() / 2.0).abs() < 1e-9);

        let kb = derive_chart("get", &opts, &results, Metric::AllocKBsPerOp, Scale::Log);
        assert_eq!(kb.lines[0].points[0].y, 2.0);
        assert_eq!(kb.file_stem(), "prime-count-allocKBsop-log");
    }

    #[test]
    fn test_standard_tree_layout() {
        let mut mem = WorkerDatastore::new("memory-map", "mm");
        mem.tags.push("memory".into());
        let flat = WorkerDatastore::new("flatfs", "flatfs");

        let series = Arc::new(Series::new(
            "get",
            "get-all",
            vec![BenchOptions::new(1, 1024, 1), BenchOptions::new(2, 1024, 1)],
        ));
        series.record("mm", 0, m(1.0, 0));
        series.record("flatfs", 1, m(2.0, 0));

        let batch = BatchSpec {
            datastores: vec![mem, flat],
            workers: BTreeMap::from([("local".to_string(), vec![Worker::local()])]),
            jobs: BTreeMap::from([("local".to_string(), vec![series])]),
        };

        let dir = tempfile::tempdir().unwrap();
        let written = standard_plots(&batch, dir.path(), &JsonChartRenderer).unwrap();
        // all, tag-memory, ds-memory-map, ds-flatfs, tag--avg, ds--avg
        assert_eq!(written, 6 * 8);

        let local = dir.path().join("local");
        for sub in ["", "tag-memory", "ds-memory-map", "ds-flatfs", "tag--avg", "ds--avg"] {
            let file = local.join(sub).join("get-all").join("prime-count-nsop.json");
            assert!(file.exists(), "missing {}", file.display());
        }

        let avg: Chart = serde_json::from_slice(
            &std::fs::read(local.join("ds--avg/get-all/prime-count-nsop.json")).unwrap(),
        )
        .unwrap();
        let labels: Vec<&str> = avg.lines.iter().map(|l| l.label.as_str()).collect();
        assert_eq!(labels, vec!["flatfs", "memory-map"]);
    }
}
