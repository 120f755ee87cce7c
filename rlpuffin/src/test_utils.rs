//! Helpers for tests: snapshot builders and a shell script posing as a fuzzer.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::RlConfig;
use crate::fuzzer::FuzzerBackend;
use crate::telemetry::{MetricsSnapshot, StatsSchema, DEFAULT_SCHEMA};

pub const STATS_FILE: &str = "fuzzer_stats";
/// Written by the script backend, one line per directive it observed
pub const OBSERVED_STRATEGIES: &str = "strategies";

pub fn snapshot(
    coverage_percent: f64,
    unique_crashes: u64,
    exec_per_sec: f64,
    unique_paths: u64,
    queue_size: u64,
    elapsed_seconds: f64,
) -> MetricsSnapshot {
    MetricsSnapshot {
        coverage_percent,
        unique_crashes,
        exec_per_sec,
        unique_paths,
        queue_size,
        elapsed_seconds,
    }
}

/// Small and fast configuration for campaigns in tests
pub fn fast_config() -> RlConfig {
    RlConfig {
        poll_interval_seconds: 0.05,
        buffer_capacity: 8,
        minibatch_size: 4,
        epochs: 2,
        hidden_layers: vec![8],
        checkpoint_every_updates: 1,
        seed: Some(1),
        shutdown_grace_seconds: 2.0,
        ..RlConfig::default()
    }
}

const COUNTING_LOOP: &str = r#"
out="$1"
mkdir -p "$out/crashes" "$out/queue"
touch "$out/queue/id:000000,orig:seed"
i=0
while [ -z "$LIMIT" ] || [ "$i" -lt "$LIMIT" ]; do
  i=$((i + 1))
  if [ "$i" -eq 3 ]; then
    touch "$out/crashes/id:000000,sig:11"
  fi
  {
    printf 'coverage_percent : %s.5%%\n' "$((i % 90))"
    printf 'crashes          : %s\n' "$((i / 4))"
    printf 'execs_per_sec    : %s\n' "${EXECS:-$((100 + i))}"
    printf 'paths_total      : %s\n' "$((10 + i))"
    printf 'queue_size       : %s\n' "$((1 + i / 2))"
    printf 'run_time         : %s\n' "$i"
  } > "$out/stats.tmp"
  mv "$out/stats.tmp" "$out/fuzzer_stats"
  if [ -n "$RLPUFFIN_STRATEGY_FILE" ] && [ -f "$RLPUFFIN_STRATEGY_FILE" ]; then
    cat "$RLPUFFIN_STRATEGY_FILE" >> "$out/strategies"
  fi
  sleep 0.05
done
"#;

/// Runs a shell script in place of a fuzzer. The script gets the output directory as `$1`.
#[derive(Clone, Debug)]
pub struct ScriptBackend {
    program: String,
    script: String,
    limit: Option<u64>,
    /// Fixed `execs_per_sec` reported instead of the growing one
    execs: Option<String>,
}

impl ScriptBackend {
    /// Writes statistics with steadily growing counters; `run_time` advances by one
    /// every iteration
    pub fn counting() -> Self {
        Self {
            program: "sh".to_string(),
            script: COUNTING_LOOP.to_string(),
            limit: None,
            execs: None,
        }
    }

    /// Like `counting`, but exits after `iterations` statistics updates
    pub fn exiting_after(iterations: u64) -> Self {
        Self {
            limit: Some(iterations),
            ..Self::counting()
        }
    }

    /// Like `counting`, but reports an execution speed of `execs_per_sec` on every update
    pub fn reporting_speed(execs_per_sec: &str) -> Self {
        Self {
            execs: Some(execs_per_sec.to_string()),
            ..Self::counting()
        }
    }

    /// Never writes any statistics
    pub fn silent() -> Self {
        Self {
            script: "while true; do sleep 0.05; done".to_string(),
            ..Self::counting()
        }
    }

    /// Keeps writing statistics that cannot be parsed
    pub fn garbage() -> Self {
        Self {
            script: r#"
                while true; do
                  printf 'coverage_percent : lots\n' > "$1/fuzzer_stats"
                  sleep 0.05
                done
            "#
            .to_string(),
            ..Self::counting()
        }
    }

    /// A fuzzer binary which does not exist
    pub fn missing() -> Self {
        Self {
            program: "/nonexistent/rlpuffin-test-fuzzer".to_string(),
            ..Self::counting()
        }
    }
}

impl FuzzerBackend for ScriptBackend {
    fn name(&self) -> &'static str {
        "script"
    }

    fn schema(&self) -> StatsSchema {
        DEFAULT_SCHEMA
    }

    fn stats_file(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(STATS_FILE)
    }

    fn command(
        &self,
        _target: &Path,
        output_dir: &Path,
        _strategy_file: Option<&Path>,
    ) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-c")
            .arg(&self.script)
            .arg("rlpuffin-script")
            .arg(output_dir);
        match self.limit {
            Some(limit) => command.env("LIMIT", limit.to_string()),
            None => command.env_remove("LIMIT"),
        };
        match &self.execs {
            Some(execs) => command.env("EXECS", execs),
            None => command.env_remove("EXECS"),
        };
        command
    }
}
