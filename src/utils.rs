//! # Utility Functions and Helper Module
//!
//! Small helpers used throughout the coordinator: human-readable formatting
//! for log output, the statistics used when reducing measurements for plots,
//! and path helpers for resolving configuration paths.
//!
//! ## Usage Examples
//!
//! ```rust
//! use ds_bench::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! assert_eq!(format_bytes(1536), "1.50 KB");
//!
//! let (mean, std_dev) = mean_std_dev(&[2.0, 4.0]);
//! assert_eq!(mean, 3.0);
//! assert!((std_dev - 2f64.sqrt()).abs() < 1e-9);
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Generate a unique identifier for a coordinator run
///
/// Attached to the coordinator's tracing span so that log lines of
/// consecutive resumes of the same batch can be told apart.
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Convert nanoseconds to a human-readable duration string
///
/// ```rust
/// # use ds_bench::utils::format_duration_ns;
/// assert_eq!(format_duration_ns(500), "500ns");
/// assert_eq!(format_duration_ns(1500), "1.50μs");
/// ```
pub fn format_duration_ns(ns: u64) -> String {
    format_duration(Duration::from_nanos(ns))
}

/// Format a duration in a human-readable way
///
/// ## Unit Selection
///
/// - Nanoseconds below 1µs, then µs, ms and s with 2 decimal places
/// - Compound `Xm Ys` / `Xh Ym Zs` format from one minute on
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format bytes in a human-readable way, using binary (1024-based) scaling
pub fn format_bytes(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{:.0} B", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Mean and sample standard deviation of a set of values
///
/// The standard deviation uses the unbiased `n - 1` estimator and is zero for
/// fewer than two samples. An empty slice yields `(0.0, 0.0)`.
pub fn mean_std_dev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }

    let count = values.len() as f64;
    let mean = values.iter().sum::<f64>() / count;
    if values.len() < 2 {
        return (mean, 0.0);
    }

    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (count - 1.0);
    (mean, variance.sqrt())
}

/// Expand a leading `~` to the current user's home directory
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix('~') {
        Some(rest) => {
            let home = std::env::var_os("HOME").context("HOME is not set")?;
            Ok(PathBuf::from(home).join(rest.trim_start_matches('/')))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Resolve `path` against the current working directory
///
/// The path does not need to exist yet.
pub fn absolute_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    Ok(cwd.join(path))
}
