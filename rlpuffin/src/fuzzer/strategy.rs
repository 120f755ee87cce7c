use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Coarse mutation strategy the policy selects for the fuzzer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Bitflip,
    Byteflip,
    Arithmetic,
    Havoc,
    Splice,
}

impl Action {
    pub const COUNT: usize = 5;

    /// All actions, ordered by their index in the policy output
    pub const ALL: [Action; Action::COUNT] = [
        Action::Bitflip,
        Action::Byteflip,
        Action::Arithmetic,
        Action::Havoc,
        Action::Splice,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Action> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Action::Bitflip => "bitflip",
            Action::Byteflip => "byteflip",
            Action::Arithmetic => "arithmetic",
            Action::Havoc => "havoc",
            Action::Splice => "splice",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Publishes the current strategy directive to the fuzzer through a file.
///
/// The file is replaced atomically, so the fuzzer either sees the previous or the new
/// directive, never a partial one.
#[derive(Debug, Clone)]
pub struct StrategyChannel {
    path: PathBuf,
    current: Option<Action>,
}

impl StrategyChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Option<Action> {
        self.current
    }

    pub fn apply(&mut self, action: Action, directive: &str) -> Result<(), Error> {
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, format!("{}\n", directive))?;
        fs::rename(&staging, &self.path)?;

        if self.current != Some(action) {
            debug!("Switched mutation strategy to {} ({})", action, directive);
        }
        self.current = Some(action);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn test_action_indices() {
        for (i, action) in Action::ALL.iter().enumerate() {
            assert_eq!(action.index(), i);
            assert_eq!(Action::from_index(i), Some(*action));
        }
        assert_eq!(Action::from_index(Action::COUNT), None);
        assert_eq!(Action::Havoc.to_string(), "havoc");
    }

    #[test_log::test]
    fn test_channel_replaces_directive() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = StrategyChannel::new(dir.path().join("strategy"));
        assert_eq!(channel.current(), None);

        channel.apply(Action::Bitflip, "bitflip").unwrap();
        channel.apply(Action::Splice, "splice").unwrap();

        assert_eq!(fs::read_to_string(channel.path()).unwrap(), "splice\n");
        assert_eq!(channel.current(), Some(Action::Splice));
        assert!(!dir.path().join("strategy.tmp").exists());
    }
}
