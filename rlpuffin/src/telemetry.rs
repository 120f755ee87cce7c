//! Reads the statistics snapshot the external fuzzer periodically writes to disk.
//!
//! The fuzzer owns the file and rewrites it while we read it, so a read may observe a
//! missing, empty or partially flushed file. A missing or empty file means "no data yet";
//! a partially written one is read again after a short backoff instead of being parsed.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::trace;
use serde::{Deserialize, Serialize};

const READ_BACKOFF: Duration = Duration::from_millis(10);

/// One statistics snapshot of the fuzzer. Never mutated once produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub coverage_percent: f64,
    pub unique_crashes: u64,
    pub exec_per_sec: f64,
    pub unique_paths: u64,
    pub queue_size: u64,
    pub elapsed_seconds: f64,
}

impl Display for MetricsSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run_time: {:.0}s, coverage: {:.2}%, crashes: {}, exec/sec: {:.1}, paths: {}, \
             queue: {}",
            self.elapsed_seconds,
            self.coverage_percent,
            self.unique_crashes,
            self.exec_per_sec,
            self.unique_paths,
            self.queue_size
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryError {
    MissingField(&'static str),
    InvalidValue { field: &'static str, value: String },
    /// The snapshot did not end with a complete line on any attempt
    Truncated,
    IO(String),
}

impl std::error::Error for TelemetryError {}

impl Display for TelemetryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryError::MissingField(field) => write!(f, "missing field `{}`", field),
            TelemetryError::InvalidValue { field, value } => {
                write!(f, "invalid value `{}` for field `{}`", value, field)
            }
            TelemetryError::Truncated => write!(f, "statistics file is partially written"),
            TelemetryError::IO(err) => write!(f, "io error: {}", err),
        }
    }
}

impl From<io::Error> for TelemetryError {
    fn from(err: io::Error) -> Self {
        TelemetryError::IO(err.to_string())
    }
}

/// Keys under which each metric may appear in the statistics file. The first key which
/// is present wins.
#[derive(Clone, Copy, Debug)]
pub struct StatsSchema {
    pub coverage_percent: &'static [&'static str],
    pub unique_crashes: &'static [&'static str],
    pub exec_per_sec: &'static [&'static str],
    pub unique_paths: &'static [&'static str],
    pub queue_size: &'static [&'static str],
    pub elapsed_seconds: &'static [&'static str],
}

pub const DEFAULT_SCHEMA: StatsSchema = StatsSchema {
    coverage_percent: &["coverage_percent"],
    unique_crashes: &["crashes"],
    exec_per_sec: &["execs_per_sec"],
    unique_paths: &["paths_total"],
    queue_size: &["queue_size"],
    elapsed_seconds: &["run_time"],
};

impl Default for StatsSchema {
    fn default() -> Self {
        DEFAULT_SCHEMA
    }
}

impl StatsSchema {
    /// Parses `key : value` lines. Values may carry a trailing `%`.
    pub fn parse(&self, content: &str) -> Result<MetricsSnapshot, TelemetryError> {
        let fields: HashMap<&str, &str> = content
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim(), value.trim()))
            .collect();

        let coverage_percent = number(&fields, self.coverage_percent)?;
        if coverage_percent > 100.0 {
            return Err(TelemetryError::InvalidValue {
                field: self.coverage_percent[0],
                value: coverage_percent.to_string(),
            });
        }

        Ok(MetricsSnapshot {
            coverage_percent,
            unique_crashes: number(&fields, self.unique_crashes)?.round() as u64,
            exec_per_sec: number(&fields, self.exec_per_sec)?,
            unique_paths: number(&fields, self.unique_paths)?.round() as u64,
            queue_size: number(&fields, self.queue_size)?.round() as u64,
            elapsed_seconds: number(&fields, self.elapsed_seconds)?,
        })
    }
}

fn number(
    fields: &HashMap<&str, &str>,
    keys: &'static [&'static str],
) -> Result<f64, TelemetryError> {
    let (key, raw) = keys
        .iter()
        .find_map(|key| fields.get(key).map(|raw| (*key, *raw)))
        .ok_or(TelemetryError::MissingField(keys.first().copied().unwrap_or("")))?;

    match raw.trim_end_matches('%').trim().parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(value),
        _ => Err(TelemetryError::InvalidValue {
            field: key,
            value: raw.to_string(),
        }),
    }
}

#[derive(Clone, Debug)]
pub struct TelemetryReader {
    path: PathBuf,
    schema: StatsSchema,
    attempts: usize,
}

impl TelemetryReader {
    pub fn new(path: impl Into<PathBuf>, schema: StatsSchema, attempts: usize) -> Self {
        Self {
            path: path.into(),
            schema,
            attempts: attempts.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the latest snapshot, `None` while the fuzzer has not written one yet.
    pub fn read(&self) -> Result<Option<MetricsSnapshot>, TelemetryError> {
        let mut last_err = TelemetryError::Truncated;

        for attempt in 0..self.attempts {
            if attempt > 0 {
                thread::sleep(READ_BACKOFF * attempt as u32);
            }

            let content = match fs::read_to_string(&self.path) {
                Ok(content) => content,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(err) => {
                    last_err = err.into();
                    continue;
                }
            };

            if content.trim().is_empty() {
                return Ok(None);
            }

            if !content.ends_with('\n') {
                trace!("statistics at {} are mid-flush", self.path.display());
                last_err = TelemetryError::Truncated;
                continue;
            }

            match self.schema.parse(&content) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(err) => last_err = err,
            }
        }

        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATS: &str = "coverage_percent : 50.00%\n\
                         crashes          : 3\n\
                         execs_per_sec    : 200.5\n\
                         paths_total      : 500\n\
                         queue_size       : 10\n\
                         run_time         : 10\n";

    fn reader_for(dir: &tempfile::TempDir) -> TelemetryReader {
        TelemetryReader::new(dir.path().join("fuzzer_stats"), DEFAULT_SCHEMA, 3)
    }

    #[test_log::test]
    fn test_parse_snapshot() {
        let snapshot = DEFAULT_SCHEMA.parse(STATS).unwrap();
        assert_eq!(
            snapshot,
            MetricsSnapshot {
                coverage_percent: 50.0,
                unique_crashes: 3,
                exec_per_sec: 200.5,
                unique_paths: 500,
                queue_size: 10,
                elapsed_seconds: 10.0,
            }
        );
    }

    #[test_log::test]
    fn test_absent_file_is_no_data() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(reader_for(&dir).read(), Ok(None));

        fs::write(dir.path().join("fuzzer_stats"), "").unwrap();
        assert_eq!(reader_for(&dir).read(), Ok(None));
    }

    #[test_log::test]
    fn test_truncated_record_is_not_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let cut = &STATS[..STATS.len() - 4];
        fs::write(dir.path().join("fuzzer_stats"), cut).unwrap();

        assert_eq!(reader_for(&dir).read(), Err(TelemetryError::Truncated));
    }

    #[test_log::test]
    fn test_missing_and_invalid_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fuzzer_stats");

        fs::write(&path, "coverage_percent : 1.0\ncrashes : 0\n").unwrap();
        assert_eq!(
            reader_for(&dir).read(),
            Err(TelemetryError::MissingField("execs_per_sec"))
        );

        fs::write(&path, STATS.replace("200.5", "fast")).unwrap();
        assert!(matches!(
            reader_for(&dir).read(),
            Err(TelemetryError::InvalidValue {
                field: "execs_per_sec",
                ..
            })
        ));
    }

    #[test_log::test]
    fn test_aliases_pick_first_present_key() {
        const SCHEMA: StatsSchema = StatsSchema {
            coverage_percent: &["coverage_percent", "bitmap_cvg"],
            unique_crashes: &["crashes", "saved_crashes"],
            ..DEFAULT_SCHEMA
        };
        let stats = STATS
            .replace("coverage_percent", "bitmap_cvg")
            .replace("crashes ", "saved_crashes ");

        let snapshot = SCHEMA.parse(&stats).unwrap();
        assert_eq!(snapshot.coverage_percent, 50.0);
        assert_eq!(snapshot.unique_crashes, 3);
    }
}
