use crate::config::CoordinatorConfig;
use crate::plot::PlotFormat;
use clap::Parser;
use std::path::PathBuf;

/// Distributed datastore benchmark coordinator
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Batch template (JSON) used when no checkpoint exists yet
    #[clap(short = 'b', long, help_heading = "Batch")]
    pub batch: Option<PathBuf>,

    /// Continue from an existing checkpoint
    #[clap(short = 'c', long = "resume", help_heading = "Batch")]
    pub resume: bool,

    /// Checkpoint file holding the batch and all results so far
    #[clap(long, default_value = crate::defaults::CHECKPOINT_FILE, help_heading = "Batch")]
    pub checkpoint: PathBuf,

    /// Root directory of the generated plots
    #[clap(long, default_value = crate::defaults::PLOT_DIR)]
    pub plot_dir: PathBuf,

    /// Format of the generated charts
    #[clap(long, value_enum, default_value_t = PlotFormat::Svg)]
    pub plot_format: PlotFormat,

    /// Also write every series on its own as results-<PlotName>.json below
    /// this directory
    #[clap(long)]
    pub series_dir: Option<PathBuf>,

    /// Benchmark program copied to every worker
    #[clap(long, default_value = crate::defaults::WORKER_BIN)]
    pub worker_bin: PathBuf,

    /// Regenerate plots from the checkpoint without running anything
    #[clap(long, default_value_t = false)]
    pub plots_only: bool,

    /// More output (repeatable)
    #[clap(short = 'v', long, action = clap::ArgAction::Count, help_heading = "Logging")]
    pub verbose: u8,

    /// Only warnings and errors
    #[clap(short = 'q', long, conflicts_with = "verbose", help_heading = "Logging")]
    pub quiet: bool,

    /// Also write a plain log to this file
    #[clap(long, help_heading = "Logging")]
    pub log_file: Option<PathBuf>,
}

impl From<&Args> for CoordinatorConfig {
    fn from(args: &Args) -> Self {
        Self {
            checkpoint: args.checkpoint.clone(),
            plot_dir: args.plot_dir.clone(),
            worker_bin: args.worker_bin.clone(),
            resume: args.resume,
            plot_format: args.plot_format,
            series_dir: args.series_dir.clone(),
        }
    }
}
