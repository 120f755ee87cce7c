use std::{fmt, fmt::Formatter, io};

use crate::telemetry::TelemetryError;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The fuzzer statistics could not be read or parsed
    Telemetry(TelemetryError),
    /// The external fuzzer could not be started. The loop never enters `Running`.
    ProcessLaunch(String),
    /// The training loss stayed non-finite across too many consecutive updates
    TrainingDivergence { consecutive: usize },
    /// A transition was appended to a full experience buffer. Indicates a bug in the
    /// orchestration.
    Capacity { capacity: usize },
    /// A checkpoint could not be written, read or decoded
    Checkpoint(String),
    /// A configuration file is invalid or contains out of range values
    Config(String),
    IO(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::Telemetry(err) => write!(f, "error reading fuzzer telemetry: {}", err),
            Error::ProcessLaunch(err) => write!(f, "failed to launch the fuzzer: {}", err),
            Error::TrainingDivergence { consecutive } => write!(
                f,
                "training diverged: {} consecutive updates produced a non-finite loss",
                consecutive
            ),
            Error::Capacity { capacity } => write!(
                f,
                "experience buffer is full (capacity {}) and was not drained",
                capacity
            ),
            Error::Checkpoint(err) => write!(f, "error regarding a checkpoint: {}", err),
            Error::Config(err) => write!(f, "invalid configuration: {}", err),
            Error::IO(err) => write!(f, "error in io: {}", err),
        }
    }
}

impl From<TelemetryError> for Error {
    fn from(err: TelemetryError) -> Self {
        Error::Telemetry(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Checkpoint(err.to_string())
    }
}
