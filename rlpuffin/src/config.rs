//! Configuration of the feedback loop, the reward model and the PPO hyperparameters.
//!
//! All structs deserialize from TOML and every field falls back to its default, so an
//! empty or partial file is a valid configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// One day
const MAX_POLL_INTERVAL: f64 = 86_400.0;
const MAX_SHUTDOWN_GRACE: f64 = 3_600.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlConfig {
    /// Seconds between two reads of the fuzzer statistics
    pub poll_interval_seconds: f64,
    /// Number of transitions collected before a training pass
    pub buffer_capacity: usize,
    pub minibatch_size: usize,
    pub epochs: usize,
    pub clip_epsilon: f64,
    pub gamma: f64,
    pub gae_lambda: f64,
    pub value_coeff: f64,
    pub entropy_coeff: f64,
    pub learning_rate: f64,
    /// Global norm the gradient is clipped to before each parameter update
    pub max_grad_norm: f64,
    /// Widths of the hidden layers of both the actor and the critic
    pub hidden_layers: Vec<usize>,
    pub reward_weights: RewardWeights,
    pub reward_scales: RewardScales,
    /// Subtracted from the reward when neither coverage nor paths moved
    pub stagnation_penalty: f64,
    /// Bound non-finite or exploding rewards are clamped to
    pub reward_clip: f64,
    pub normalization: Normalization,
    /// Consecutive failed telemetry reads after which the episode ends
    pub telemetry_retry_budget: usize,
    /// Re-reads of a statistics file which looks partially written
    pub telemetry_read_attempts: usize,
    /// Consecutive non-finite training passes after which training is considered diverged
    pub max_consecutive_divergences: usize,
    pub checkpoint_every_updates: u64,
    /// Whether the transitions left in the buffer at shutdown are trained on
    pub train_on_partial_buffer: bool,
    pub seed: Option<u64>,
    pub shutdown_grace_seconds: f64,
}

impl Default for RlConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 60.0,
            buffer_capacity: 2048,
            minibatch_size: 64,
            epochs: 10,
            clip_epsilon: 0.2,
            gamma: 0.99,
            gae_lambda: 0.95,
            value_coeff: 0.5,
            entropy_coeff: 0.01,
            learning_rate: 3e-4,
            max_grad_norm: 0.5,
            hidden_layers: vec![64, 64],
            reward_weights: RewardWeights::default(),
            reward_scales: RewardScales::default(),
            stagnation_penalty: 0.0,
            reward_clip: 1e6,
            normalization: Normalization::default(),
            telemetry_retry_budget: 3,
            telemetry_read_attempts: 3,
            max_consecutive_divergences: 3,
            checkpoint_every_updates: 10,
            train_on_partial_buffer: true,
            seed: None,
            shutdown_grace_seconds: 10.0,
        }
    }
}

impl RlConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace_seconds.max(0.0))
    }

    pub fn validate(&self) -> Result<(), Error> {
        fn check(ok: bool, msg: &str) -> Result<(), Error> {
            if ok {
                Ok(())
            } else {
                Err(Error::Config(msg.to_string()))
            }
        }

        check(
            self.poll_interval_seconds > 0.0 && self.poll_interval_seconds <= MAX_POLL_INTERVAL,
            "poll_interval_seconds must be in (0, 86400]",
        )?;
        check(
            (0.0..=MAX_SHUTDOWN_GRACE).contains(&self.shutdown_grace_seconds),
            "shutdown_grace_seconds must be in [0, 3600]",
        )?;
        check(self.buffer_capacity > 0, "buffer_capacity must be positive")?;
        check(self.minibatch_size > 0, "minibatch_size must be positive")?;
        check(self.epochs > 0, "epochs must be positive")?;
        check(
            self.clip_epsilon > 0.0 && self.clip_epsilon < 1.0,
            "clip_epsilon must be in (0, 1)",
        )?;
        check((0.0..=1.0).contains(&self.gamma), "gamma must be in [0, 1]")?;
        check(
            (0.0..=1.0).contains(&self.gae_lambda),
            "gae_lambda must be in [0, 1]",
        )?;
        check(
            self.learning_rate.is_finite() && self.learning_rate > 0.0,
            "learning_rate must be positive",
        )?;
        check(
            self.max_grad_norm.is_finite() && self.max_grad_norm > 0.0,
            "max_grad_norm must be positive",
        )?;
        check(
            self.reward_clip.is_finite() && self.reward_clip > 0.0,
            "reward_clip must be positive",
        )?;
        check(
            self.reward_scales.speed_reference > 0.0 && self.reward_scales.path_delta_scale > 0.0,
            "reward_scales must be positive",
        )?;
        check(
            self.normalization.speed_reference > 0.0
                && self.normalization.queue_reference > 0.0
                && self.normalization.paths_reference > 0.0
                && self.normalization.crash_half_saturation > 0.0
                && self.normalization.max_feature > 0.0,
            "normalization constants must be positive",
        )?;
        check(
            self.telemetry_read_attempts > 0,
            "telemetry_read_attempts must be positive",
        )?;
        check(
            self.max_consecutive_divergences > 0,
            "max_consecutive_divergences must be positive",
        )?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardWeights {
    pub coverage: f64,
    pub crash: f64,
    pub speed: f64,
    pub diversity: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            coverage: 1.0,
            crash: 10.0,
            speed: 0.1,
            diversity: 0.5,
        }
    }
}

/// Divisors applied to the raw speed and path terms of the reward
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardScales {
    pub speed_reference: f64,
    pub path_delta_scale: f64,
}

impl Default for RewardScales {
    fn default() -> Self {
        Self {
            speed_reference: 1.0,
            path_delta_scale: 1.0,
        }
    }
}

/// Reference constants used to squash raw metrics into the state vector
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Normalization {
    /// Crash count at which the crash feature reaches one half
    pub crash_half_saturation: f64,
    pub speed_reference: f64,
    pub queue_reference: f64,
    pub paths_reference: f64,
    /// Upper bound of every state feature
    pub max_feature: f64,
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            crash_half_saturation: 10.0,
            speed_reference: 1000.0,
            queue_reference: 1000.0,
            paths_reference: 10000.0,
            max_feature: 10.0,
        }
    }
}

/// Loads a TOML file into `T`. A missing path yields the defaults.
pub fn load_toml<T>(path: Option<&Path>) -> Result<T, Error>
where
    T: DeserializeOwned + Default,
{
    match path {
        Some(path) => {
            let content = fs::read_to_string(path).map_err(|err| {
                Error::Config(format!("failed to read {}: {}", path.display(), err))
            })?;
            Ok(toml::from_str::<T>(&content)?)
        }
        None => Ok(T::default()),
    }
}
