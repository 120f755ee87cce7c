//! rlpuffin steers an external coverage-guided fuzzer by learning online which mutation
//! strategy to apply next. Fuzzer statistics are turned into a state and a reward, stored
//! as transitions and periodically fed to a PPO update of an actor-critic policy.

pub mod buffer;
pub mod cancel;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod error;
pub mod experiment;
pub mod feedback;
pub mod fuzzer;
pub mod log;
pub mod metrics;
pub mod orchestrator;
pub mod policy;
pub mod ppo;
pub mod telemetry;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub const GIT_REF: &str = match option_env!("GIT_REF") {
    Some(env) => env,
    None => "undefined",
};

pub const MAYBE_GIT_REF: Option<&str> = option_env!("GIT_REF");
