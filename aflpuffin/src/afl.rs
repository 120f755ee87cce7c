//! AFL++ as the fuzzer driven by the loop.
//!
//! AFL++ has no switch for its mutation stages at runtime. Strategy directives reach it
//! through a custom mutator library (`AFL_CUSTOM_MUTATOR_LIBRARY`) which reads the
//! directive file named in `RLPUFFIN_STRATEGY_FILE`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::warn;
use rlpuffin::config::load_toml;
use rlpuffin::error::Error;
use rlpuffin::fuzzer::{Action, FuzzerBackend};
use rlpuffin::telemetry::StatsSchema;
use serde::{Deserialize, Serialize};

/// `fuzzer_stats` keys of AFL++, with the names older releases used as fallbacks
pub const AFL_SCHEMA: StatsSchema = StatsSchema {
    coverage_percent: &["bitmap_cvg"],
    unique_crashes: &["saved_crashes", "unique_crashes"],
    exec_per_sec: &["execs_per_sec"],
    unique_paths: &["corpus_found", "paths_found"],
    queue_size: &["corpus_count", "paths_total"],
    elapsed_seconds: &["run_time"],
};

/// Name of the main instance, AFL++ writes into `<output>/<instance>/`
const INSTANCE: &str = "default";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AflBackend {
    pub binary_path: PathBuf,
    /// Seed corpus
    pub input_dir: PathBuf,
    pub timeout_ms: u64,
    /// Memory limit in MB, or `none`
    pub memory_limit: String,
    pub qemu_mode: bool,
    /// Custom mutator applying the strategy directives
    pub custom_mutator: Option<PathBuf>,
    /// Arguments of the target, `@@` is replaced by AFL++ with the input file
    pub target_args: Vec<String>,
    /// Extra environment for AFL++, e.g. `AFL_SKIP_CPUFREQ`
    pub env: BTreeMap<String, String>,
}

impl Default for AflBackend {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("afl-fuzz"),
            input_dir: PathBuf::from("seeds"),
            timeout_ms: 1000,
            memory_limit: "none".to_string(),
            qemu_mode: false,
            custom_mutator: None,
            target_args: vec!["@@".to_string()],
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    afl: AflBackend,
}

/// Reads the `[afl]` table of a fuzzer configuration file
pub fn load_config(path: Option<&Path>) -> Result<AflBackend, Error> {
    Ok(load_toml::<ConfigFile>(path)?.afl)
}

impl FuzzerBackend for AflBackend {
    fn name(&self) -> &'static str {
        "afl"
    }

    fn schema(&self) -> StatsSchema {
        AFL_SCHEMA
    }

    fn stats_file(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(INSTANCE).join("fuzzer_stats")
    }

    fn command(&self, target: &Path, output_dir: &Path, strategy_file: Option<&Path>) -> Command {
        let mut command = Command::new(&self.binary_path);
        command
            .arg("-i")
            .arg(&self.input_dir)
            .arg("-o")
            .arg(output_dir)
            .arg("-t")
            .arg(self.timeout_ms.to_string())
            .arg("-m")
            .arg(&self.memory_limit);
        if self.qemu_mode {
            command.arg("-Q");
        }
        command.arg("--").arg(target).args(&self.target_args);

        command.env("AFL_NO_UI", "1").envs(&self.env);
        if strategy_file.is_some() {
            match &self.custom_mutator {
                Some(library) => {
                    command.env("AFL_CUSTOM_MUTATOR_LIBRARY", library);
                }
                None => warn!("No custom mutator configured, AFL++ will not see strategy changes"),
            }
        }
        command
    }

    fn encode_strategy(&self, action: Action) -> String {
        format!("{}:{}", action.index(), action.name())
    }

    fn crash_dir(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(INSTANCE).join("crashes")
    }

    fn queue_dir(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(INSTANCE).join("queue")
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;

    use super::*;

    const FUZZER_STATS: &str = "start_time        : 1700000000\n\
                                last_update       : 1700000600\n\
                                run_time          : 600\n\
                                fuzzer_pid        : 4242\n\
                                cycles_done       : 2\n\
                                execs_done        : 1200000\n\
                                execs_per_sec     : 2000.13\n\
                                corpus_count      : 310\n\
                                corpus_found      : 298\n\
                                pending_total     : 120\n\
                                bitmap_cvg        : 12.34%\n\
                                saved_crashes     : 4\n\
                                saved_hangs       : 1\n\
                                afl_version       : ++4.08c\n";

    fn args(command: &Command) -> Vec<&OsStr> {
        command.get_args().collect()
    }

    #[test_log::test]
    fn test_parse_fuzzer_stats() {
        let snapshot = AFL_SCHEMA.parse(FUZZER_STATS).unwrap();

        assert_eq!(snapshot.coverage_percent, 12.34);
        assert_eq!(snapshot.unique_crashes, 4);
        assert_eq!(snapshot.exec_per_sec, 2000.13);
        assert_eq!(snapshot.unique_paths, 298);
        assert_eq!(snapshot.queue_size, 310);
        assert_eq!(snapshot.elapsed_seconds, 600.0);

        let legacy = FUZZER_STATS
            .replace("saved_crashes", "unique_crashes")
            .replace("corpus_found", "paths_found");
        assert_eq!(AFL_SCHEMA.parse(&legacy).unwrap(), snapshot);
    }

    #[test_log::test]
    fn test_command_line() {
        let backend = AflBackend {
            qemu_mode: true,
            custom_mutator: Some(PathBuf::from("/opt/strategy-mutator.so")),
            ..AflBackend::default()
        };
        let strategy = Path::new("/tmp/exp/strategy");
        let command = backend.command(
            Path::new("/bin/target"),
            Path::new("/tmp/exp/fuzzer"),
            Some(strategy),
        );

        assert_eq!(command.get_program(), "afl-fuzz");
        assert_eq!(
            args(&command),
            [
                "-i", "seeds", "-o", "/tmp/exp/fuzzer", "-t", "1000", "-m", "none", "-Q", "--",
                "/bin/target", "@@"
            ]
            .map(OsStr::new)
        );

        let envs: BTreeMap<&OsStr, Option<&OsStr>> = command.get_envs().collect();
        assert_eq!(envs[OsStr::new("AFL_NO_UI")], Some(OsStr::new("1")));
        assert_eq!(
            envs[OsStr::new("AFL_CUSTOM_MUTATOR_LIBRARY")],
            Some(OsStr::new("/opt/strategy-mutator.so"))
        );

        let baseline = backend.command(Path::new("/bin/target"), Path::new("/tmp/out"), None);
        assert!(baseline
            .get_envs()
            .all(|(key, _)| key != "AFL_CUSTOM_MUTATOR_LIBRARY"));
    }

    #[test_log::test]
    fn test_layout_and_directives() {
        let backend = AflBackend::default();
        let out = Path::new("/tmp/out");

        assert_eq!(backend.stats_file(out), out.join("default/fuzzer_stats"));
        assert_eq!(backend.crash_dir(out), out.join("default/crashes"));
        assert_eq!(backend.queue_dir(out), out.join("default/queue"));
        assert_eq!(backend.encode_strategy(Action::Arithmetic), "2:arithmetic");
    }

    #[test_log::test]
    fn test_config_file() {
        let file: ConfigFile = toml::from_str(
            r#"
            [afl]
            binary_path = "/usr/local/bin/afl-fuzz"
            timeout_ms = 500
            target_args = ["-d", "@@"]

            [afl.env]
            AFL_SKIP_CPUFREQ = "1"
            "#,
        )
        .unwrap();

        assert_eq!(file.afl.binary_path, PathBuf::from("/usr/local/bin/afl-fuzz"));
        assert_eq!(file.afl.timeout_ms, 500);
        assert_eq!(file.afl.memory_limit, "none");
        assert_eq!(file.afl.target_args, vec!["-d", "@@"]);
        assert_eq!(file.afl.env["AFL_SKIP_CPUFREQ"], "1");

        assert_eq!(load_config(None).unwrap(), AflBackend::default());
    }
}
