//! Progress sampling and the final throughput summary.
//!
//! ## Output Format
//!
//! All outputs are plain text, one record per line, so that they can be processed with shell
//! scripts. A run prints a configuration echo, then progress samples, then a summary:
//!
//! ```txt
//! cluster engine memory nodes 2 mode replicated
//! startup nodes 2 elapsed 1.27 milliseconds
//! benchmark readers 45 writers 5 keys_per_node 100 payload 1024 transactional true seed 42
//! sample phase warmup elapsed 10.00 reads 1200000 writes 130000 rps 120000.00 wps 13000.00
//! sample phase measure elapsed 10.00 reads 1250000 writes 131000 rps 125000.00 wps 13100.00
//! summary status completed duration 60.00 reads 7500000 writes 790000 failures 12 rps 125000.00 wps 13166.67
//! ```
//!
//! The summary line has the format:
//!
//! ```txt
//! summary status <s> duration <d> reads <r> writes <w> failures <f> rps <x> wps <y>
//! ```
//!
//! Where `<s>` is how the measurement ended (`completed`, `stalled`, `interrupted`, `fault`),
//! `<d>` is the measurement duration in seconds, `<f>` is the number of attempted operations that
//! failed (included in `<r>` and `<w>`), and `<x>`/`<y>` are reads and writes per second. A rate
//! is printed as `immediate` if the measured duration is zero. If nothing was measured, the part
//! after `duration <d>` is replaced by `no data`. If draining the workers timed out, ` drain
//! timed out` is appended.
//!
//! When latency recording is on, the summary line also carries latency fields, in microseconds:
//!
//! ```txt
//! min_us <i> max_us <a> avg_us <v> p50_us <m> p95_us <n> p99_us <p> p999_us <t>
//! ```

use crate::bench::{QuitReason, RunPhase};
use hdrhistogram::Histogram;
use std::fmt;
use std::time::Duration;

/// Which lines are printed.
///
/// - "hidden": nothing.
/// - "sample": the configuration echo and the progress samples.
/// - "finish": the configuration echo and the summary.
/// - "all": everything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportMode {
    Hidden,
    Sample,
    Finish,
    All,
}

impl ReportMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hidden" => Some(ReportMode::Hidden),
            "sample" => Some(ReportMode::Sample),
            "finish" => Some(ReportMode::Finish),
            "all" => Some(ReportMode::All),
            _ => None,
        }
    }

    fn samples(&self) -> bool {
        matches!(self, ReportMode::Sample | ReportMode::All)
    }

    fn finish(&self) -> bool {
        matches!(self, ReportMode::Finish | ReportMode::All)
    }
}

/// Operations per second, or `None` if no time has elapsed.
pub fn rate(count: u64, elapsed: Duration) -> Option<f64> {
    let nanos = elapsed.as_nanos();
    if nanos == 0 {
        None
    } else {
        Some(count as f64 * 1e9 / nanos as f64)
    }
}

struct Rate(Option<f64>);

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(r) => write!(f, "{:.2}", r),
            None => write!(f, "immediate"),
        }
    }
}

/// Latency percentiles of the measured operations, in nanoseconds.
#[derive(Clone, Debug, PartialEq)]
pub struct LatencySummary {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub p999: u64,
}

impl LatencySummary {
    pub fn from_histogram(hdr: &Histogram<u64>) -> Option<Self> {
        if hdr.is_empty() {
            return None;
        }
        Some(Self {
            count: hdr.len(),
            min: hdr.min(),
            max: hdr.max(),
            mean: hdr.mean(),
            p50: hdr.value_at_quantile(0.50),
            p95: hdr.value_at_quantile(0.95),
            p99: hdr.value_at_quantile(0.99),
            p999: hdr.value_at_quantile(0.999),
        })
    }
}

impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "min_us {:.2} max_us {:.2} avg_us {:.2} \
             p50_us {:.2} p95_us {:.2} p99_us {:.2} p999_us {:.2}",
            self.min as f64 / 1000.0,
            self.max as f64 / 1000.0,
            self.mean / 1000.0,
            self.p50 as f64 / 1000.0,
            self.p95 as f64 / 1000.0,
            self.p99 as f64 / 1000.0,
            self.p999 as f64 / 1000.0,
        )
    }
}

/// The result of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct Summary {
    /// Attempted reads during the measurement, failed ones included.
    pub reads: u64,
    /// Attempted writes during the measurement, failed ones included.
    pub writes: u64,
    /// How many of the attempted operations failed.
    pub failures: u64,
    /// From the start of the measurement to the end of draining.
    pub elapsed: Duration,
    /// Why the measurement ended.
    pub termination: QuitReason,
    /// Whether all workers exited within the drain timeout.
    pub drained: bool,
    /// How many workers panicked.
    pub faulted_workers: usize,
    pub latency: Option<LatencySummary>,
}

impl Summary {
    pub fn total(&self) -> u64 {
        self.reads + self.writes
    }

    /// Nothing was measured, e.g., the whole budget went into the warm-up.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn reads_per_sec(&self) -> Option<f64> {
        rate(self.reads, self.elapsed)
    }

    pub fn writes_per_sec(&self) -> Option<f64> {
        rate(self.writes, self.elapsed)
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status {} duration {:.2}",
            self.termination.status(),
            self.elapsed.as_secs_f64()
        )?;
        if self.is_empty() {
            write!(f, " no data")?;
        } else {
            write!(
                f,
                " reads {} writes {} failures {} rps {} wps {}",
                self.reads,
                self.writes,
                self.failures,
                Rate(self.reads_per_sec()),
                Rate(self.writes_per_sec()),
            )?;
            if let Some(ref latency) = self.latency {
                write!(f, " {}", latency)?;
            }
        }
        if !self.drained {
            write!(f, " drain timed out")?;
        }
        Ok(())
    }
}

/// The output sink of a run.
#[derive(Debug)]
pub struct Reporter {
    mode: ReportMode,
}

impl Reporter {
    pub fn new(mode: ReportMode) -> Self {
        Self { mode }
    }

    /// Print a configuration line.
    pub fn echo(&self, line: &str) {
        if self.mode != ReportMode::Hidden {
            println!("{}", line);
        }
    }

    /// Record a progress sample and return the formatted line.
    pub fn sample(&self, phase: RunPhase, elapsed: Duration, reads: u64, writes: u64) -> String {
        let line = format!(
            "sample phase {} elapsed {:.2} reads {} writes {} rps {} wps {}",
            phase,
            elapsed.as_secs_f64(),
            reads,
            writes,
            Rate(rate(reads, elapsed)),
            Rate(rate(writes, elapsed)),
        );
        if self.mode.samples() {
            println!("{}", line);
        }
        line
    }

    /// Print the final summary and return the formatted line.
    pub fn summarize(&self, summary: &Summary) -> String {
        let line = format!("summary {}", summary);
        log::info!(
            "Done {} operations in {}",
            summary.total(),
            format_duration(summary.elapsed)
        );
        if self.mode.finish() {
            println!("{}", line);
        }
        line
    }
}

/// A human-readable duration, e.g., `1.50 seconds`.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    let secs = d.as_secs_f64();
    if nanos < 1_000 {
        format!("{} nanoseconds", nanos)
    } else if nanos < 1_000_000 {
        format!("{:.2} microseconds", nanos as f64 / 1e3)
    } else if nanos < 1_000_000_000 {
        format!("{:.2} milliseconds", nanos as f64 / 1e6)
    } else if secs < 60.0 {
        format!("{:.2} seconds", secs)
    } else if secs < 3600.0 {
        format!("{:.2} minutes", secs / 60.0)
    } else {
        format!("{:.2} hours", secs / 3600.0)
    }
}

/// A human-readable byte size, e.g., `10.00 KiB`.
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["bytes", "KiB", "MiB", "GiB", "TiB"];
    let mut val = bytes as f64;
    let mut mag = 0;
    while val >= 1024.0 && mag < UNITS.len() - 1 {
        val /= 1024.0;
        mag += 1;
    }
    if mag == 0 {
        format!("{} bytes", bytes)
    } else {
        format!("{:.2} {}", val, UNITS[mag])
    }
}
