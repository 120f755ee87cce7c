//! The boundary to the external fuzzer: how it is launched, where it reports statistics
//! and how a mutation strategy is handed to it.

use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::telemetry::StatsSchema;

mod process;
mod strategy;

pub use process::FuzzerProcess;
pub use strategy::{Action, StrategyChannel};

/// Environment variable holding the path of the strategy directive file
pub const STRATEGY_FILE_ENV: &str = "RLPUFFIN_STRATEGY_FILE";

/// A concrete fuzzer driven by the loop
pub trait FuzzerBackend: Clone + Debug {
    /// Short name used in experiment titles
    fn name(&self) -> &'static str;

    fn schema(&self) -> StatsSchema;

    fn stats_file(&self, output_dir: &Path) -> PathBuf;

    /// Command line launching the fuzzer on `target`, writing into `output_dir`.
    /// `strategy_file` is set when the policy steers the fuzzer through a directive file,
    /// the loop also exports it as [`STRATEGY_FILE_ENV`].
    fn command(&self, target: &Path, output_dir: &Path, strategy_file: Option<&Path>) -> Command;

    /// Directive understood by the fuzzer for `action`
    fn encode_strategy(&self, action: Action) -> String {
        action.name().to_string()
    }

    fn crash_dir(&self, output_dir: &Path) -> PathBuf {
        output_dir.join("crashes")
    }

    fn queue_dir(&self, output_dir: &Path) -> PathBuf {
        output_dir.join("queue")
    }
}

/// Counts the saved inputs (`id:*` files) in a fuzzer output directory
pub fn count_entries(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|entry| entry.file_name().to_string_lossy().starts_with("id:"))
                .count()
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn test_count_entries() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(count_entries(&dir.path().join("missing")), 0);

        for name in ["id:000000,sig:11", "id:000001,sig:06", "README.txt"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(count_entries(dir.path()), 2);
    }
}
