//! Per-tick metrics export and the end-of-campaign summaries.
//!
//! Rows are streamed to `metrics.jsonl` while the campaign runs, so a crashed campaign
//! still leaves its time series behind. The tabular `metrics.csv` is written once at the
//! end.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::fuzzer::Action;
use crate::orchestrator::Mode;
use crate::telemetry::MetricsSnapshot;

pub const JSONL_FILE: &str = "metrics.jsonl";
pub const CSV_FILE: &str = "metrics.csv";

const CSV_HEADER: [&str; 12] = [
    "tick",
    "mode",
    "timestamp_seconds",
    "coverage_percent",
    "unique_crashes",
    "exec_per_sec",
    "unique_paths",
    "queue_size",
    "elapsed_seconds",
    "reward",
    "action",
    "interesting",
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsRow {
    pub tick: u64,
    pub mode: Mode,
    /// Seconds since the unix epoch
    pub timestamp_seconds: f64,
    #[serde(flatten)]
    pub snapshot: MetricsSnapshot,
    pub reward: Option<f64>,
    pub action: Option<Action>,
    pub interesting: bool,
}

impl MetricsRow {
    fn csv_line(&self) -> String {
        let s = &self.snapshot;
        [
            self.tick.to_string(),
            self.mode.to_string(),
            format!("{:.3}", self.timestamp_seconds),
            s.coverage_percent.to_string(),
            s.unique_crashes.to_string(),
            s.exec_per_sec.to_string(),
            s.unique_paths.to_string(),
            s.queue_size.to_string(),
            s.elapsed_seconds.to_string(),
            self.reward.map(|r| r.to_string()).unwrap_or_default(),
            self.action.map(|a| a.to_string()).unwrap_or_default(),
            self.interesting.to_string(),
        ]
        .iter()
        .join(",")
    }
}

pub struct MetricsRecorder {
    directory: PathBuf,
    jsonl: BufWriter<File>,
    rows: Vec<MetricsRow>,
}

impl MetricsRecorder {
    pub fn create(directory: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(directory.join(JSONL_FILE))?;

        Ok(Self {
            directory: directory.to_path_buf(),
            jsonl: BufWriter::new(file),
            rows: vec![],
        })
    }

    pub fn record(&mut self, row: MetricsRow) -> Result<(), Error> {
        serde_json::to_writer(&mut self.jsonl, &row)
            .map_err(|err| Error::IO(format!("failed to write metrics row: {}", err)))?;
        self.jsonl.write_all(b"\n")?;
        self.jsonl.flush()?;
        self.rows.push(row);
        Ok(())
    }

    pub fn rows(&self) -> &[MetricsRow] {
        &self.rows
    }

    /// Writes `metrics.csv` and returns the summary of all recorded rows
    pub fn finish(mut self) -> Result<Summary, Error> {
        self.jsonl.flush()?;

        let mut csv = BufWriter::new(File::create(self.directory.join(CSV_FILE))?);
        writeln!(csv, "{}", CSV_HEADER.iter().join(","))?;
        for row in &self.rows {
            writeln!(csv, "{}", row.csv_line())?;
        }
        csv.flush()?;

        Ok(Summary::from_rows(&self.rows))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub ticks: usize,
    pub final_coverage: f64,
    pub total_crashes: u64,
    pub mean_exec_speed: f64,
    pub max_exec_speed: f64,
    pub total_paths: u64,
    pub runtime_hours: f64,
}

impl Summary {
    pub fn from_rows(rows: &[MetricsRow]) -> Self {
        let Some(last) = rows.last() else {
            return Self::default();
        };
        let speeds = rows.iter().map(|r| r.snapshot.exec_per_sec);

        Self {
            ticks: rows.len(),
            final_coverage: last.snapshot.coverage_percent,
            total_crashes: last.snapshot.unique_crashes,
            mean_exec_speed: speeds.clone().sum::<f64>() / rows.len() as f64,
            max_exec_speed: speeds.fold(0.0, f64::max),
            total_paths: last.snapshot.unique_paths,
            runtime_hours: last.snapshot.elapsed_seconds / 3600.0,
        }
    }
}

/// Relative change of the RL-enhanced run over the baseline, in percent
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Improvement {
    pub coverage_percent: f64,
    pub crashes_percent: f64,
    pub speed_percent: f64,
    pub paths_percent: f64,
}

impl Improvement {
    pub fn between(baseline: &Summary, enhanced: &Summary) -> Self {
        fn relative(base: f64, value: f64, floor: f64) -> f64 {
            (value - base) / base.max(floor) * 100.0
        }

        Self {
            coverage_percent: relative(baseline.final_coverage, enhanced.final_coverage, 0.01),
            crashes_percent: relative(
                baseline.total_crashes as f64,
                enhanced.total_crashes as f64,
                1.0,
            ),
            speed_percent: relative(baseline.mean_exec_speed, enhanced.mean_exec_speed, 1.0),
            paths_percent: relative(
                baseline.total_paths as f64,
                enhanced.total_paths as f64,
                1.0,
            ),
        }
    }
}

/// Written to `results_summary.json` when a campaign stops
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultsSummary {
    pub mode: Mode,
    pub target: PathBuf,
    pub output_dir: PathBuf,
    pub final_metrics: Option<MetricsSnapshot>,
    pub crash_artifacts: usize,
    pub queue_entries: usize,
    pub runtime_seconds: f64,
    pub termination: String,
    pub training_passes: u64,
    pub summary: Summary,
}

/// Writes `comparison.json` after a baseline and an RL-enhanced campaign
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub baseline: Summary,
    pub rl_enhanced: Summary,
    pub improvement: Improvement,
}

impl Comparison {
    pub fn new(baseline: Summary, rl_enhanced: Summary) -> Self {
        Self {
            improvement: Improvement::between(&baseline, &rl_enhanced),
            baseline,
            rl_enhanced,
        }
    }
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|err| Error::IO(format!("failed to encode {}: {}", path.display(), err)))?;
    std::fs::write(path, content)?;
    Ok(())
}
