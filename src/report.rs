//! # Benchmark Report Parser
//!
//! The benchmark program prints one line per named sub-benchmark:
//!
//! ```text
//! BenchmarkSpec/pre=1-size=1024-batch=1-8   	  500000	      2514 ns/op	 407.26 MB/s	    1184 B/op	       9 allocs/op
//! ```
//!
//! that is, a name, an iteration count and then `value unit` pairs. Only the
//! units `ns/op`, `MB/s`, `B/op` and `allocs/op` are interpreted; other pairs
//! are ignored. Lines that do not look like a benchmark line (`goos: linux`,
//! `PASS`, log chatter) are skipped.

use crate::error::ReportError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::BufRead;
use tracing::debug;

/// Bit flags recording which optional fields a report line carried.
pub mod measured {
    pub const NS_PER_OP: u8 = 1 << 0;
    pub const MB_PER_S: u8 = 1 << 1;
    pub const ALLOCED_BYTES_PER_OP: u8 = 1 << 2;
    pub const ALLOCS_PER_OP: u8 = 1 << 3;
}

/// Parsed result of one sub-benchmark run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    /// Iteration count chosen by the benchmark harness
    pub n: u64,
    pub ns_per_op: f64,
    pub alloced_bytes_per_op: u64,
    pub allocs_per_op: u64,
    pub mb_per_s: f64,
    /// Which of the optional fields were present, see [`measured`]
    pub measured: u8,
    /// Position of the line within the report
    pub ord: usize,
}

impl Measurement {
    pub fn has(&self, flag: u8) -> bool {
        self.measured & flag != 0
    }
}

/// Report lines grouped by benchmark name.
pub type ReportSet = BTreeMap<String, Vec<Measurement>>;

/// Parse one report line.
///
/// Returns `None` for lines that are not benchmark lines, including
/// `Benchmark...` lines whose iteration count is not a number. A value that
/// does not parse leaves its field unset.
pub fn parse_line(line: &str) -> Option<Measurement> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 || !fields[0].starts_with("Benchmark") {
        return None;
    }

    let Ok(n) = fields[1].parse::<u64>() else {
        debug!(line, "skipping benchmark line with invalid iteration count");
        return None;
    };

    let mut m = Measurement {
        name: fields[0].to_string(),
        n,
        ..Default::default()
    };

    for pair in fields[2..].chunks(2) {
        let [value, unit] = pair else {
            break;
        };
        match *unit {
            "ns/op" => {
                if let Ok(v) = value.parse() {
                    m.ns_per_op = v;
                    m.measured |= measured::NS_PER_OP;
                }
            }
            "MB/s" => {
                if let Ok(v) = value.parse() {
                    m.mb_per_s = v;
                    m.measured |= measured::MB_PER_S;
                }
            }
            "B/op" => {
                if let Ok(v) = value.parse() {
                    m.alloced_bytes_per_op = v;
                    m.measured |= measured::ALLOCED_BYTES_PER_OP;
                }
            }
            "allocs/op" => {
                if let Ok(v) = value.parse() {
                    m.allocs_per_op = v;
                    m.measured |= measured::ALLOCS_PER_OP;
                }
            }
            _ => {}
        }
    }

    Some(m)
}

/// Parse a whole report stream into groups keyed by benchmark name.
///
/// Only reading the stream can fail; the number of groups and lines is left
/// for the caller to check.
pub fn parse_set<R: BufRead>(reader: R) -> Result<ReportSet, ReportError> {
    let mut set = ReportSet::new();
    let mut ord = 0;

    for line in reader.lines() {
        if let Some(mut m) = parse_line(&line?) {
            m.ord = ord;
            ord += 1;
            set.entry(m.name.clone()).or_default().push(m);
        }
    }

    Ok(set)
}
